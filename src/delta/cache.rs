//! Per-URL snapshot history (bounded FIFO, bounded per-key) and the
//! structural-equivalence delta diff (design notes §3, §4.G). Built on the
//! `lru` crate for key-level eviction, as used elsewhere in the retrieved
//! corpus for bounded caches.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::snapshot::{PageSnapshot, WidgetSnapshot};

#[derive(Debug, Clone)]
pub enum DeltaResponse {
    Full { hash: String, page: PageSnapshot },
    Changes {
        hash: String,
        title: String,
        changes: Vec<WidgetSnapshot>,
    },
}

/// The wire shape uses a literal JSON boolean for `delta`, not a tagged
/// variant name, so serialization is hand-rolled rather than derived.
impl Serialize for DeltaResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DeltaResponse::Full { hash, page } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("delta", &false)?;
                map.serialize_entry("hash", hash)?;
                map.serialize_entry("page", page)?;
                map.end()
            }
            DeltaResponse::Changes {
                hash,
                title,
                changes,
            } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("delta", &true)?;
                map.serialize_entry("hash", hash)?;
                map.serialize_entry("title", title)?;
                map.serialize_entry("changes", changes)?;
                map.end()
            }
        }
    }
}

pub struct DeltaCache {
    history_per_key: usize,
    inner: Mutex<LruCache<String, VecDeque<PageSnapshot>>>,
}

impl DeltaCache {
    pub fn new(max_keys: usize, history_per_key: usize) -> Self {
        let capacity = NonZeroUsize::new(max_keys.max(1)).expect("max_keys clamped to >= 1");
        Self {
            history_per_key: history_per_key.min(5).max(1),
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().expect("delta cache lock poisoned").len()
    }

    pub fn history_len(&self, key: &str) -> usize {
        self.inner
            .lock()
            .expect("delta cache lock poisoned")
            .peek(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Record a freshly-fetched snapshot for `key`, dropping the oldest
    /// history entry once the per-key window is exceeded. The LRU eviction
    /// of whole keys happens implicitly via `LruCache::get_or_insert_mut`.
    fn record(&self, key: &str, snapshot: PageSnapshot) {
        let mut cache = self.inner.lock().expect("delta cache lock poisoned");
        let history = cache.get_or_insert_mut(key.to_string(), VecDeque::new);
        history.push_back(snapshot);
        while history.len() > self.history_per_key {
            history.pop_front();
        }
    }

    fn find_by_content_hash(&self, key: &str, since: &str) -> Option<PageSnapshot> {
        let mut cache = self.inner.lock().expect("delta cache lock poisoned");
        let history = cache.peek(key)?;
        history
            .iter()
            .rev()
            .find(|snap| snap.content_hash == since)
            .cloned()
    }

    /// Compute the delta (or full-page fallback) response for `key` given a
    /// freshly-built `snapshot` and an optional client-supplied `since`
    /// baseline hash, then append `snapshot` to the key's history.
    pub fn compute(&self, key: &str, snapshot: PageSnapshot, since: Option<&str>) -> DeltaResponse {
        let response = match since.and_then(|since| self.find_by_content_hash(key, since)) {
            Some(previous) if previous.structural_hash == snapshot.structural_hash => {
                match diff(&previous, &snapshot) {
                    Some(changes) => DeltaResponse::Changes {
                        hash: snapshot.content_hash.clone(),
                        title: snapshot.title.clone(),
                        changes,
                    },
                    // A key vanished from the old snapshot despite matching
                    // structural hashes: fall back to a full page rather
                    // than risk an incomplete diff.
                    None => DeltaResponse::Full {
                        hash: snapshot.content_hash.clone(),
                        page: snapshot.clone(),
                    },
                }
            }
            _ => DeltaResponse::Full {
                hash: snapshot.content_hash.clone(),
                page: snapshot.clone(),
            },
        };

        self.record(key, snapshot);
        response
    }
}

/// Diff the ordered entries by key; for each present-in-both pair, emit the
/// new entry if any rendered field changed. Returns `None` if any key from
/// the old snapshot is absent in the new one (the caller must fall back to
/// a full page in that case).
fn diff(old: &PageSnapshot, new: &PageSnapshot) -> Option<Vec<WidgetSnapshot>> {
    let mut changes = Vec::new();
    for (key, old_widget) in &old.entries {
        let new_widget = new.entries.get(key)?;
        if old_widget.label != new_widget.label
            || old_widget.state != new_widget.state
            || old_widget.value_color != new_widget.value_color
            || old_widget.icon != new_widget.icon
            || old_widget.mappings_signature != new_widget.mappings_signature
        {
            changes.push(new_widget.clone());
        }
    }
    Some(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snapshot_from(json: &str) -> PageSnapshot {
        let page: crate::upstream::PageJson = serde_json::from_str(json).unwrap();
        super::super::snapshot::build_snapshot(&page, &HashMap::new())
    }

    #[test]
    fn first_fetch_returns_full_page() {
        let cache = DeltaCache::new(16, 5);
        let snap = snapshot_from(r#"{"title":"Home","widgets":[]}"#);
        let response = cache.compute("home", snap, None);
        assert!(matches!(response, DeltaResponse::Full { .. }));
    }

    #[test]
    fn unchanged_upstream_returns_empty_changes_same_hash() {
        let cache = DeltaCache::new(16, 5);
        let snap1 = snapshot_from(
            r#"{"title":"Home","widgets":[{"type":"Switch","label":"L","item":{"name":"L","state":"ON"}}]}"#,
        );
        let h1 = snap1.content_hash.clone();
        cache.compute("home", snap1, None);

        let snap2 = snapshot_from(
            r#"{"title":"Home","widgets":[{"type":"Switch","label":"L","item":{"name":"L","state":"ON"}}]}"#,
        );
        let response = cache.compute("home", snap2, Some(&h1));
        match response {
            DeltaResponse::Changes { hash, changes, .. } => {
                assert!(changes.is_empty());
                assert_eq!(hash, h1);
            }
            DeltaResponse::Full { .. } => panic!("expected a changes delta"),
        }
    }

    #[test]
    fn changed_item_produces_delta_with_single_change() {
        let cache = DeltaCache::new(16, 5);
        let snap1 = snapshot_from(
            r#"{"title":"Home","widgets":[{"type":"Text","label":"L [1]","item":{"name":"L"}}]}"#,
        );
        let h1 = snap1.content_hash.clone();
        cache.compute("home", snap1, None);

        let snap2 = snapshot_from(
            r#"{"title":"Home","widgets":[{"type":"Text","label":"L [2]","item":{"name":"L"}}]}"#,
        );
        let response = cache.compute("home", snap2, Some(&h1));
        match response {
            DeltaResponse::Changes { changes, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].state.as_deref(), Some("2"));
            }
            DeltaResponse::Full { .. } => panic!("expected a changes delta"),
        }
    }

    #[test]
    fn structural_change_forces_full_page_even_with_known_since() {
        let cache = DeltaCache::new(16, 5);
        let snap1 = snapshot_from(
            r#"{"title":"Home","widgets":[{"type":"Switch","label":"A","item":{"name":"A","state":"ON"}}]}"#,
        );
        let h1 = snap1.content_hash.clone();
        cache.compute("home", snap1, None);

        let snap2 = snapshot_from(
            r#"{"title":"Home","widgets":[
                {"type":"Switch","label":"A","item":{"name":"A","state":"ON"}},
                {"type":"Switch","label":"B","item":{"name":"B","state":"ON"}}
            ]}"#,
        );
        let response = cache.compute("home", snap2, Some(&h1));
        assert!(matches!(response, DeltaResponse::Full { .. }));
    }

    #[test]
    fn history_per_key_never_exceeds_five() {
        let cache = DeltaCache::new(16, 5);
        for i in 0..10 {
            let snap = snapshot_from(&format!(
                r#"{{"title":"Home","widgets":[{{"type":"Text","label":"L [{}]","item":{{"name":"L"}}}}]}}"#,
                i
            ));
            cache.compute("home", snap, None);
        }
        assert_eq!(cache.history_len("home"), 5);
    }

    #[test]
    fn evicts_least_recently_inserted_key_beyond_capacity() {
        let cache = DeltaCache::new(2, 5);
        cache.compute("a", snapshot_from(r#"{"title":"A","widgets":[]}"#), None);
        cache.compute("b", snapshot_from(r#"{"title":"B","widgets":[]}"#), None);
        cache.compute("c", snapshot_from(r#"{"title":"C","widgets":[]}"#), None);
        assert_eq!(cache.key_count(), 2);
        assert_eq!(cache.history_len("a"), 0);
    }
}

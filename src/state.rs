//! Last-known item-state map and group-aggregate recomputation (design
//! notes §4.E). A single `apply_group_overrides` function is shared by the
//! WebSocket broadcast path and the delta-cache compute path so hash
//! stability holds across both (§9, open question).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::UpstreamConfig;
use crate::error::RelayResult;
use crate::upstream::UpstreamClient;

pub const GROUP_OPEN_SENTINEL: &str = "OPEN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemChange {
    pub name: String,
    pub state: String,
}

struct Seen {
    state: String,
    last_seen: Instant,
}

/// Authoritative item-state table plus the last-emitted group-aggregate
/// counts. Written only by the subscription layer and this detector; read
/// by the delta cache (via `apply_group_overrides`) and nobody else during
/// broadcast, since a batch is already materialized before it is handed off.
pub struct StateDetector {
    items: DashMap<String, Seen>,
    group_counts: DashMap<String, u64>,
    group_items: Vec<String>,
}

impl StateDetector {
    pub fn new(group_items: Vec<String>) -> Self {
        Self {
            items: DashMap::new(),
            group_counts: DashMap::new(),
            group_items,
        }
    }

    pub fn current_state(&self, name: &str) -> Option<String> {
        self.items.get(name).map(|s| s.state.clone())
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.items
            .iter()
            .map(|e| (e.key().clone(), e.value().state.clone()))
            .collect()
    }

    /// Filter a batch of incoming changes down to real transitions, updating
    /// the state map as it goes. Order of `changes` is preserved (§5
    /// ordering guarantees).
    pub fn apply_batch(&self, changes: Vec<ItemChange>) -> Vec<ItemChange> {
        let now = Instant::now();
        let mut emitted = Vec::with_capacity(changes.len());
        for change in changes {
            let is_transition = match self.items.get(&change.name) {
                Some(existing) => existing.state != change.state,
                None => true,
            };
            self.items.insert(
                change.name.clone(),
                Seen {
                    state: change.state.clone(),
                    last_seen: now,
                },
            );
            if is_transition {
                emitted.push(change);
            }
        }
        emitted
    }

    /// Remove entries not seen since `max_age` ago (the hourly stale-state
    /// pruning timer of §4.E).
    pub fn prune_stale(&self, max_age: Duration) {
        let now = Instant::now();
        self.items
            .retain(|_, seen| now.duration_since(seen.last_seen) < max_age);
    }

    /// Re-fetch and recompute every configured group-aggregate item not
    /// already present in `batch`, emitting a synthetic [`ItemChange`] for
    /// any whose count differs from the last emitted count.
    pub async fn recompute_groups(
        &self,
        client: &UpstreamClient,
        upstream: &UpstreamConfig,
        batch: &[ItemChange],
    ) -> Vec<ItemChange> {
        let already_present: std::collections::HashSet<&str> =
            batch.iter().map(|c| c.name.as_str()).collect();
        let mut synthetic = Vec::new();

        for group in &self.group_items {
            if already_present.contains(group.as_str()) {
                continue;
            }
            match self.fetch_group_count(client, upstream, group).await {
                Ok(count) => {
                    let changed = self
                        .group_counts
                        .get(group)
                        .map(|c| *c != count)
                        .unwrap_or(true);
                    if changed {
                        self.group_counts.insert(group.clone(), count);
                        let state = count.to_string();
                        self.items.insert(
                            group.clone(),
                            Seen {
                                state: state.clone(),
                                last_seen: Instant::now(),
                            },
                        );
                        synthetic.push(ItemChange {
                            name: group.clone(),
                            state,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(group = %group, error = %e, "failed to recompute group state");
                }
            }
        }
        synthetic
    }

    async fn fetch_group_count(
        &self,
        client: &UpstreamClient,
        upstream: &UpstreamConfig,
        group: &str,
    ) -> RelayResult<u64> {
        #[derive(serde::Deserialize)]
        struct Member {
            state: Option<String>,
        }
        #[derive(serde::Deserialize)]
        struct GroupItem {
            #[serde(default)]
            members: Vec<Member>,
        }

        let resp = client
            .get(upstream, &format!("rest/items/{}", group))
            .await?;
        let parsed: GroupItem = serde_json::from_slice(&resp.body)?;
        Ok(parsed
            .members
            .iter()
            .filter(|m| m.state.as_deref() == Some(GROUP_OPEN_SENTINEL))
            .count() as u64)
    }

    /// Overlay any group-aggregate overrides onto a `name -> state` map
    /// before it is rendered into a page snapshot, so the content hash
    /// reflects the aggregate rather than the raw upstream string.
    pub fn apply_group_overrides(&self, states: &mut HashMap<String, String>) {
        for entry in self.group_counts.iter() {
            states.insert(entry.key().clone(), entry.value().to_string());
        }
    }
}

pub type SharedStateDetector = Arc<StateDetector>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_state_is_dropped() {
        let detector = StateDetector::new(vec![]);
        let first = detector.apply_batch(vec![ItemChange {
            name: "A".into(),
            state: "OFF".into(),
        }]);
        assert_eq!(first.len(), 1);

        let second = detector.apply_batch(vec![ItemChange {
            name: "A".into(),
            state: "OFF".into(),
        }]);
        assert!(second.is_empty());
    }

    #[test]
    fn transition_is_emitted_and_state_updated() {
        let detector = StateDetector::new(vec![]);
        detector.apply_batch(vec![ItemChange {
            name: "A".into(),
            state: "ON".into(),
        }]);
        let emitted = detector.apply_batch(vec![ItemChange {
            name: "A".into(),
            state: "OFF".into(),
        }]);
        assert_eq!(emitted.len(), 1);
        assert_eq!(detector.current_state("A").as_deref(), Some("OFF"));
    }

    #[test]
    fn empty_batch_leaves_state_untouched() {
        let detector = StateDetector::new(vec![]);
        detector.apply_batch(vec![ItemChange {
            name: "A".into(),
            state: "ON".into(),
        }]);
        let before = detector.snapshot();
        detector.apply_batch(vec![]);
        assert_eq!(detector.snapshot(), before);
    }

    #[test]
    fn prune_removes_only_stale_entries() {
        let detector = StateDetector::new(vec![]);
        detector.apply_batch(vec![ItemChange {
            name: "A".into(),
            state: "ON".into(),
        }]);
        detector.prune_stale(Duration::from_secs(3600));
        assert_eq!(detector.current_state("A").as_deref(), Some("ON"));

        detector.prune_stale(Duration::from_millis(0));
        assert_eq!(detector.current_state("A"), None);
    }

    #[test]
    fn group_overrides_applied_on_top_of_raw_state() {
        let detector = StateDetector::new(vec!["GroupItem".into()]);
        detector.group_counts.insert("GroupItem".into(), 2);
        let mut states = HashMap::new();
        states.insert("GroupItem".into(), "raw-upstream-value".into());
        detector.apply_group_overrides(&mut states);
        assert_eq!(states.get("GroupItem").map(String::as_str), Some("2"));
    }
}

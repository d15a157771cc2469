//! Structural and content hashing. Both are SHA-1 over a canonical
//! serialization (design notes §4.G, §8 round-trip invariants).

use indexmap::IndexMap;
use sha1::{Digest, Sha1};

use super::snapshot::WidgetSnapshot;

/// Hash of the ordered sequence of keys plus frame markers; invariant under
/// pure state changes.
pub fn structural_hash(entries: &IndexMap<String, WidgetSnapshot>) -> String {
    let mut hasher = Sha1::new();
    for widget in entries.values() {
        hasher.update(widget.key.as_bytes());
        hasher.update(if widget.is_frame { b"\x01" } else { b"\x00" });
        hasher.update(b"\x1e");
    }
    hex::encode(hasher.finalize())
}

/// Hash of title plus every rendered field of every entry; changes on any
/// visible update.
pub fn content_hash(title: &str, entries: &IndexMap<String, WidgetSnapshot>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\x1e");
    for widget in entries.values() {
        hasher.update(widget.key.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(widget.label.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(widget.state.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(widget.value_color.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(widget.icon.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(widget.mappings_signature.as_bytes());
        hasher.update(b"\x1e");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entries_from(json: &str) -> IndexMap<String, WidgetSnapshot> {
        let page: crate::upstream::PageJson = serde_json::from_str(json).unwrap();
        super::super::snapshot::build_snapshot(&page, &HashMap::new()).entries
    }

    #[test]
    fn structural_hash_invariant_under_state_change_only() {
        let a = entries_from(
            r#"{"widgets":[{"type":"Switch","label":"Lamp","item":{"name":"L","state":"ON"}}]}"#,
        );
        let b = entries_from(
            r#"{"widgets":[{"type":"Switch","label":"Lamp","item":{"name":"L","state":"OFF"}}]}"#,
        );
        assert_eq!(structural_hash(&a), structural_hash(&b));
        assert_ne!(content_hash("t", &a), content_hash("t", &b));
    }

    #[test]
    fn structural_hash_changes_when_widget_added() {
        let a = entries_from(
            r#"{"widgets":[{"type":"Switch","label":"Lamp","item":{"name":"L","state":"ON"}}]}"#,
        );
        let b = entries_from(
            r#"{"widgets":[
                {"type":"Switch","label":"Lamp","item":{"name":"L","state":"ON"}},
                {"type":"Switch","label":"Fan","item":{"name":"F","state":"ON"}}
            ]}"#,
        );
        assert_ne!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn round_trip_serialization_preserves_hashes() {
        let entries = entries_from(
            r#"{"title":"Home","widgets":[{"type":"Switch","label":"Lamp","item":{"name":"L","state":"ON"}}]}"#,
        );
        let sh = structural_hash(&entries);
        let ch = content_hash("Home", &entries);

        let json = serde_json::to_string(&entries).unwrap();
        let round_tripped: IndexMap<String, WidgetSnapshot> = serde_json::from_str(&json).unwrap();
        assert_eq!(structural_hash(&round_tripped), sh);
        assert_eq!(content_hash("Home", &round_tripped), ch);
    }
}

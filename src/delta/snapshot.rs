//! Widget/page snapshot construction: normalizes upstream JSON into the
//! stable, keyed shape the delta cache diffs against (design notes §3, §4.G).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::upstream::model::{split_label, PageJson, WidgetJson};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WidgetSnapshot {
    pub key: String,
    pub id: Option<String>,
    pub item_name: Option<String>,
    pub label: String,
    pub state: Option<String>,
    pub value_color: Option<String>,
    pub icon: Option<String>,
    pub mappings_signature: String,
    pub mappings: Vec<(String, String)>,
    /// Frames are kept in the ordered entry sequence (for the structural
    /// hash) but carry no renderable fields of their own.
    pub is_frame: bool,
}

/// `{ contentHash, structuralHash, entries: Map<key, WidgetSnapshot>, title }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageSnapshot {
    pub title: String,
    pub content_hash: String,
    pub structural_hash: String,
    pub entries: IndexMap<String, WidgetSnapshot>,
}

fn widget_key(widget: &WidgetJson) -> String {
    if let Some(id) = &widget.widgetId {
        return format!("id:{}", id);
    }
    let widget_type = widget.widget_type.as_deref().unwrap_or("");
    let link = widget
        .linkedPage
        .as_ref()
        .and_then(|p| p.id.as_deref())
        .unwrap_or("");
    if let Some(item_name) = widget.item.as_ref().and_then(|i| i.name.as_deref()) {
        return format!("item:{}|{}|{}", item_name, widget_type, link);
    }
    let label = widget.label.as_deref().unwrap_or("");
    format!("label:{}|{}|{}", label, widget_type, link)
}

fn mappings_signature(mappings: &[(String, String)]) -> String {
    mappings
        .iter()
        .map(|(cmd, label)| format!("{}={}", cmd, label))
        .collect::<Vec<_>>()
        .join(";")
}

/// Flatten a widget tree into ordered entries, preserving a frame marker for
/// each `Frame` so the structural hash still sees the grouping boundary.
fn flatten(widget: &WidgetJson, out: &mut Vec<WidgetSnapshot>, group_overrides: Option<&std::collections::HashMap<String, String>>) {
    let is_frame = widget.widget_type.as_deref() == Some("Frame");
    let key = widget_key(widget);

    let raw_label = widget.label.clone().unwrap_or_default();
    let (title, label_state) = split_label(&raw_label);

    let item_name = widget.item.as_ref().and_then(|i| i.name.clone());
    let item_reported_state = widget.item.as_ref().and_then(|i| i.state.clone());

    let (item_name, mut state) = match item_name {
        Some(name) => (Some(name), item_reported_state),
        None => (None, label_state),
    };

    if let (Some(name), Some(overrides)) = (&item_name, group_overrides) {
        if let Some(overridden) = overrides.get(name) {
            state = Some(overridden.clone());
        }
    }

    let mappings: Vec<(String, String)> = widget
        .mapping
        .iter()
        .map(|m| {
            (
                m.command.clone().unwrap_or_default(),
                m.label.clone().unwrap_or_default(),
            )
        })
        .collect();

    out.push(WidgetSnapshot {
        key,
        id: widget.widgetId.clone(),
        item_name,
        label: title,
        state,
        value_color: widget.valuecolor.clone(),
        icon: widget.icon.clone(),
        mappings_signature: mappings_signature(&mappings),
        mappings,
        is_frame,
    });

    for child in &widget.widget {
        flatten(child, out, group_overrides);
    }
}

/// Build a [`PageSnapshot`] from the normalized upstream page, applying any
/// group-aggregate overrides before hashing so the content hash reflects the
/// synthesized aggregate rather than the raw upstream string (§4.E, §9).
pub fn build_snapshot(
    page: &PageJson,
    group_overrides: &std::collections::HashMap<String, String>,
) -> PageSnapshot {
    let mut flat = Vec::new();
    for widget in &page.widget {
        flatten(widget, &mut flat, Some(group_overrides));
    }

    let mut entries = IndexMap::new();
    for w in flat {
        entries.insert(w.key.clone(), w);
    }

    let title = page.title.clone().unwrap_or_default();
    let structural_hash = crate::delta::hash::structural_hash(&entries);
    let content_hash = crate::delta::hash::content_hash(&title, &entries);

    PageSnapshot {
        title,
        content_hash,
        structural_hash,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn page_with_two_widgets() -> PageJson {
        serde_json::from_str(
            r#"{
                "id": "home",
                "title": "Home",
                "widgets": [
                    {"type": "Switch", "label": "Lamp", "item": {"name": "Lamp1", "state": "ON"}},
                    {"type": "Text", "label": "Temp [21 °C]"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn builds_stable_keys_for_item_and_label_widgets() {
        let page = page_with_two_widgets();
        let snapshot = build_snapshot(&page, &HashMap::new());
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot.entries.contains_key("item:Lamp1|Switch|"));
    }

    #[test]
    fn label_with_bracket_state_is_split() {
        let page = page_with_two_widgets();
        let snapshot = build_snapshot(&page, &HashMap::new());
        let temp = snapshot
            .entries
            .values()
            .find(|w| w.label == "Temp")
            .unwrap();
        assert_eq!(temp.state.as_deref(), Some("21 °C"));
    }

    #[test]
    fn group_override_replaces_rendered_state() {
        let page = page_with_two_widgets();
        let mut overrides = HashMap::new();
        overrides.insert("Lamp1".to_string(), "3".to_string());
        let snapshot = build_snapshot(&page, &overrides);
        let lamp = &snapshot.entries["item:Lamp1|Switch|"];
        assert_eq!(lamp.state.as_deref(), Some("3"));
    }

    #[test]
    fn item_name_is_set_even_without_a_reported_state() {
        let page: PageJson = serde_json::from_str(
            r#"{
                "id": "home",
                "title": "Home",
                "widgets": [
                    {"type": "Group", "label": "Lights", "item": {"name": "Lights"}}
                ]
            }"#,
        )
        .unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("Lights".to_string(), "2 of 5 ON".to_string());
        let snapshot = build_snapshot(&page, &overrides);
        let group = &snapshot.entries["item:Lights|Group|"];
        assert_eq!(group.item_name.as_deref(), Some("Lights"));
        assert_eq!(group.state.as_deref(), Some("2 of 5 ON"));
    }

    #[test]
    fn identical_input_yields_identical_hashes() {
        let page = page_with_two_widgets();
        let a = build_snapshot(&page, &HashMap::new());
        let b = build_snapshot(&page, &HashMap::new());
        assert_eq!(a.structural_hash, b.structural_hash);
        assert_eq!(a.content_hash, b.content_hash);
    }
}

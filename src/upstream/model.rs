//! Weakly-typed upstream JSON shapes, normalized via `#[serde(alias = ...)]`
//! so both `widget`/`widgets` and `mapping`/`mappings` spellings decode into
//! the same fields (design notes §9).

use serde::{Deserialize, Serialize};

fn default_mappings() -> Vec<MappingJson> {
    Vec::new()
}

fn single_or_many<'de, D>(deserializer: D) -> Result<Vec<WidgetJson>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(WidgetJson),
        Many(Vec<WidgetJson>),
        None,
    }
    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(w) => Ok(vec![w]),
        OneOrMany::Many(ws) => Ok(ws),
        OneOrMany::None => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingJson {
    pub command: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemJson {
    pub name: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WidgetJson {
    pub widgetId: Option<String>,
    #[serde(rename = "type")]
    pub widget_type: Option<String>,
    pub label: Option<String>,
    pub icon: Option<String>,
    pub valuecolor: Option<String>,
    pub item: Option<ItemJson>,
    #[serde(alias = "mappings", default = "default_mappings")]
    pub mapping: Vec<MappingJson>,
    pub linkedPage: Option<LinkedPageJson>,
    /// A `Frame` carries nested children under the same `widget`/`widgets`
    /// aliasing rules as a page; a leaf widget has none.
    #[serde(
        alias = "widgets",
        default,
        deserialize_with = "single_or_many_opt",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub widget: Vec<WidgetJson>,
}

fn single_or_many_opt<'de, D>(deserializer: D) -> Result<Vec<WidgetJson>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    single_or_many(deserializer)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkedPageJson {
    pub id: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageJson {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(alias = "widgets", default, deserialize_with = "single_or_many")]
    pub widget: Vec<WidgetJson>,
    pub homepage: Option<Box<PageJson>>,
}

/// Split a `"Title [State]"` label into `(title, state)`; a trailing empty
/// `[]` is stripped entirely rather than yielding an empty state string.
pub fn split_label(label: &str) -> (String, Option<String>) {
    if let Some(open) = label.rfind('[') {
        if let Some(close) = label[open..].find(']') {
            let state = &label[open + 1..open + close];
            let title = label[..open].trim_end().to_string();
            return if state.is_empty() {
                (title, None)
            } else {
                (title, Some(state.to_string()))
            };
        }
    }
    (label.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widgets_alias_decodes_like_widget() {
        let json = r#"{"id":"home","title":"Home","widgets":[{"type":"Switch","label":"Lamp"}]}"#;
        let page: PageJson = serde_json::from_str(json).unwrap();
        assert_eq!(page.widget.len(), 1);
        assert_eq!(page.widget[0].widget_type.as_deref(), Some("Switch"));
    }

    #[test]
    fn mappings_alias_decodes_like_mapping() {
        let json = r#"{"type":"Selection","mappings":[{"command":"1","label":"One"}]}"#;
        let widget: WidgetJson = serde_json::from_str(json).unwrap();
        assert_eq!(widget.mapping.len(), 1);
        assert_eq!(widget.mapping[0].command.as_deref(), Some("1"));
    }

    #[test]
    fn single_widget_object_normalizes_into_vec() {
        let json = r#"{"id":"home","widget":{"type":"Frame","label":"Group"}}"#;
        let page: PageJson = serde_json::from_str(json).unwrap();
        assert_eq!(page.widget.len(), 1);
    }

    #[test]
    fn label_split_extracts_state() {
        assert_eq!(
            split_label("Temperature [21.5 °C]"),
            ("Temperature".to_string(), Some("21.5 °C".to_string()))
        );
    }

    #[test]
    fn label_split_strips_trailing_empty_brackets() {
        assert_eq!(split_label("Lamp []"), ("Lamp".to_string(), None));
    }

    #[test]
    fn label_without_brackets_is_untouched() {
        assert_eq!(split_label("Lamp"), ("Lamp".to_string(), None));
    }
}

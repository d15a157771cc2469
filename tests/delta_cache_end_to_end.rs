//! End-to-end exercise of the snapshot builder feeding the delta cache
//! across group-aggregate overrides and structural changes.

use std::collections::HashMap;

use sitemap_relay::delta::{build_snapshot, canonical_key, DeltaCache, DeltaResponse};
use sitemap_relay::state::StateDetector;
use sitemap_relay::upstream::PageJson;

fn page(json: &str) -> PageJson {
    serde_json::from_str(json).unwrap()
}

#[test]
fn group_override_flows_through_to_the_cached_snapshot() {
    let detector = StateDetector::new(vec!["OpenWindows".into()]);
    detector.apply_batch(vec![sitemap_relay::state::ItemChange {
        name: "dummy".into(),
        state: "x".into(),
    }]);

    let mut overrides = HashMap::new();
    detector.apply_group_overrides(&mut overrides);
    assert!(overrides.is_empty(), "no group count recomputed yet");

    let cache = DeltaCache::new(16, 5);
    let key = canonical_key("/rest/sitemaps/home?type=json");
    let snap = build_snapshot(
        &page(r#"{"title":"Home","widgets":[{"type":"Text","label":"Windows open","item":{"name":"OpenWindows","state":"0"}}]}"#),
        &overrides,
    );
    let response = cache.compute(&key, snap, None);
    match response {
        DeltaResponse::Full { page, .. } => {
            let entry = page.entries.values().find(|w| w.item_name.as_deref() == Some("OpenWindows")).unwrap();
            assert_eq!(entry.state.as_deref(), Some("0"));
        }
        DeltaResponse::Changes { .. } => panic!("first fetch must be a full page"),
    }
}

#[test]
fn http_and_websocket_paths_agree_on_cache_key() {
    let http_style = canonical_key("sitemaps/home/group?delta=1&since=abc");
    let ws_style = canonical_key("rest/sitemaps/home/group?type=json");
    assert_eq!(http_style, ws_style);
}

#[test]
fn unchanged_fetch_returns_empty_changes_list() {
    let cache = DeltaCache::new(16, 5);
    let json = r#"{"title":"Home","widgets":[{"type":"Switch","label":"Lamp","item":{"name":"Lamp1","state":"ON"}}]}"#;
    let first = build_snapshot(&page(json), &HashMap::new());
    let hash = first.content_hash.clone();
    cache.compute("home", first, None);

    let second = build_snapshot(&page(json), &HashMap::new());
    match cache.compute("home", second, Some(&hash)) {
        DeltaResponse::Changes { changes, .. } => assert!(changes.is_empty()),
        DeltaResponse::Full { .. } => panic!("expected a changes delta for unchanged structure"),
    }
}

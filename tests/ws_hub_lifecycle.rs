//! Exercises the client registry's connect/focus/broadcast/disconnect
//! lifecycle without a running HTTP server.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::extract::ws::Message;
use sitemap_relay::config::{ConfigWatcher, RelayConfig};
use sitemap_relay::delta::DeltaCache;
use sitemap_relay::state::StateDetector;
use sitemap_relay::subscription::SubscriptionManager;
use sitemap_relay::upstream::UpstreamClient;
use sitemap_relay::ws::WsHub;

fn hub() -> (Arc<WsHub>, Arc<ConfigWatcher>) {
    let config = Arc::new(ConfigWatcher::new(
        std::path::PathBuf::from("/nonexistent/config.toml"),
        RelayConfig::default(),
    ));
    let client = Arc::new(UpstreamClient::new());
    let state = Arc::new(StateDetector::new(vec![]));
    let any_focused = Arc::new(AtomicBool::new(false));
    let delta_cache = Arc::new(DeltaCache::new(16, 5));
    let (sink, _rx) = tokio::sync::mpsc::channel(8);
    let ctx = sitemap_relay::subscription::SubscriptionContext {
        client: client.clone(),
        config: config.clone(),
        state: state.clone(),
        sink,
        any_client_focused: any_focused.clone(),
    };
    let subscriptions = Arc::new(SubscriptionManager::new(ctx));
    let hub = Arc::new(WsHub::new(
        subscriptions,
        any_focused,
        delta_cache,
        state,
        client,
        config.clone(),
    ));
    (hub, config)
}

#[tokio::test]
async fn connect_sends_connected_and_backend_status_frames() {
    let (hub, _config) = hub();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = hub.connect("alice".to_string(), tx).await;
    assert_eq!(hub.client_count(), 1);

    let first = rx.recv().await.unwrap();
    let Message::Text(text) = first else { panic!("expected text frame") };
    assert!(text.contains("\"event\":\"connected\""));

    let second = rx.recv().await.unwrap();
    let Message::Text(text) = second else { panic!("expected text frame") };
    assert!(text.contains("\"event\":\"backendStatus\""));

    hub.disconnect(id).await;
    assert_eq!(hub.client_count(), 0);
}

#[tokio::test]
async fn broadcast_reaches_every_connected_client() {
    let (hub, _config) = hub();
    let (tx_a, mut rx_a) = tokio::sync::mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
    hub.connect("alice".to_string(), tx_a).await;
    hub.connect("bob".to_string(), tx_b).await;

    // Drain the two welcome frames each client already received.
    for _ in 0..2 {
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();
    }

    hub.broadcast("update", serde_json::json!({ "changes": [] }));

    let a = rx_a.recv().await.unwrap();
    let b = rx_b.recv().await.unwrap();
    let Message::Text(a) = a else { panic!() };
    let Message::Text(b) = b else { panic!() };
    assert!(a.contains("\"event\":\"update\""));
    assert!(b.contains("\"event\":\"update\""));
}

#[tokio::test]
async fn dead_channel_is_dropped_on_broadcast() {
    let (hub, _config) = hub();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    hub.connect("alice".to_string(), tx).await;
    drop(rx);

    hub.broadcast("update", serde_json::json!({}));
    assert_eq!(hub.client_count(), 0);
}

#[tokio::test]
async fn fetch_delta_overrides_only_group_items_not_every_cached_item() {
    let (hub, _config) = hub();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = hub.connect("alice".to_string(), tx).await;
    for _ in 0..2 {
        rx.recv().await.unwrap();
    }

    // Upstream is unreachable in this test harness, so the handler must
    // reply with an error payload rather than panicking.
    hub.handle_fetch_delta(id, "rest/sitemaps/home?type=json", None, "req-1").await;
    let reply = rx.recv().await.unwrap();
    let Message::Text(text) = reply else { panic!() };
    assert!(text.contains("\"event\":\"deltaResponse\""));
    assert!(text.contains("req-1"));
}

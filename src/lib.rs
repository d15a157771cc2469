//! Reverse proxy and real-time state-distribution engine sitting in front of
//! a home-automation REST sitemap backend: subscribes to upstream state
//! changes, coalesces them into an authoritative item-state table, and fans
//! them out to browser clients over WebSockets while serving bandwidth-
//! efficient delta responses over HTTP.

pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod delta;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod state;
pub mod subscription;
pub mod upstream;
pub mod ws;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use config::ConfigWatcher;
use delta::DeltaCache;
use state::SharedStateDetector;
use subscription::SubscriptionManager;
use upstream::UpstreamClient;
use ws::WsHub;

/// Every shared handle a request or WebSocket connection needs, cloned
/// cheaply into axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigWatcher>,
    pub client: Arc<UpstreamClient>,
    pub state: SharedStateDetector,
    pub delta_cache: Arc<DeltaCache>,
    pub auth: Arc<auth::AuthGate>,
    pub hub: Arc<WsHub>,
    pub subscriptions: Arc<SubscriptionManager>,
}

impl AppState {
    pub fn new(
        config: Arc<ConfigWatcher>,
        directory: Arc<dyn auth::UserDirectory>,
    ) -> Self {
        let cfg = config.current();
        let client = Arc::new(UpstreamClient::new());
        let state: SharedStateDetector =
            Arc::new(state::StateDetector::new(cfg.subscription.group_items.clone()));
        let delta_cache = Arc::new(DeltaCache::new(
            cfg.delta_cache.max_keys,
            cfg.delta_cache.history_per_key,
        ));
        let any_client_focused = Arc::new(AtomicBool::new(false));
        let lockout = Arc::new(auth::LockoutTracker::new(
            cfg.auth.lockout_threshold,
            cfg.auth.lockout_minutes,
            cfg.auth.stale_window_secs,
            cfg.auth.notify_throttle_minutes,
        ));
        let auth_gate = Arc::new(auth::AuthGate {
            directory,
            lockout,
            cookie_key: cfg.auth.cookie_secret.clone().into_bytes(),
        });

        // Every strategy emits batches on this channel; a dedicated task
        // drains it and broadcasts each batch as an `update` frame, keeping
        // the hub itself free of subscription-layer concerns.
        let (sink, mut changes_rx) = tokio::sync::mpsc::channel::<Vec<state::ItemChange>>(64);
        let subscription_ctx = subscription::SubscriptionContext {
            client: client.clone(),
            config: config.clone(),
            state: state.clone(),
            sink,
            any_client_focused: any_client_focused.clone(),
        };
        let subscriptions = Arc::new(SubscriptionManager::new(subscription_ctx));

        let hub = Arc::new(WsHub::new(
            subscriptions.clone(),
            any_client_focused,
            delta_cache.clone(),
            state.clone(),
            client.clone(),
            config.clone(),
        ));

        let broadcast_hub = hub.clone();
        tokio::spawn(async move {
            while let Some(changes) = changes_rx.recv().await {
                broadcast_hub.broadcast(
                    "update",
                    serde_json::json!({ "type": "items", "changes": changes }),
                );
            }
        });

        Self {
            config,
            client,
            state,
            delta_cache,
            auth: auth_gate,
            hub,
            subscriptions,
        }
    }
}

//! Connected-client registry: accept/broadcast/liveness, and the
//! client-originated `fetchDelta` request (design notes §4.F).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ConfigWatcher;
use crate::delta::DeltaCache;
use crate::state::SharedStateDetector;
use crate::subscription::{SubscriptionContext, SubscriptionManager};
use crate::upstream::model::PageJson;
use crate::upstream::UpstreamClient;

pub type ClientId = Uuid;

pub struct ConnectedClient {
    pub username: String,
    sender: mpsc::UnboundedSender<Message>,
    focused: AtomicBool,
    pending_ping: AtomicBool,
}

#[derive(Serialize)]
struct Frame<'a> {
    event: &'a str,
    data: Value,
}

fn frame_text(event: &str, data: Value) -> Message {
    let frame = Frame { event, data };
    Message::Text(serde_json::to_string(&frame).unwrap_or_default())
}

pub struct WsHub {
    clients: DashMap<ClientId, Arc<ConnectedClient>>,
    subscriptions: Arc<SubscriptionManager>,
    any_client_focused: Arc<AtomicBool>,
    delta_cache: Arc<DeltaCache>,
    state: SharedStateDetector,
    client: Arc<UpstreamClient>,
    config: Arc<ConfigWatcher>,
}

impl WsHub {
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        any_client_focused: Arc<AtomicBool>,
        delta_cache: Arc<DeltaCache>,
        state: SharedStateDetector,
        client: Arc<UpstreamClient>,
        config: Arc<ConfigWatcher>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            subscriptions,
            any_client_focused,
            delta_cache,
            state,
            client,
            config,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Register a newly-upgraded connection, sending the welcome frames, and
    /// starting the subscription strategy on the 0→1 transition.
    pub async fn connect(&self, username: String, sender: mpsc::UnboundedSender<Message>) -> ClientId {
        let id = Uuid::new_v4();
        let client = Arc::new(ConnectedClient {
            username,
            sender,
            focused: AtomicBool::new(true),
            pending_ping: AtomicBool::new(false),
        });
        let was_empty = self.clients.is_empty();
        self.clients.insert(id, client.clone());
        self.recompute_focus();

        let _ = client.sender.send(frame_text(
            "connected",
            serde_json::json!({ "clientId": id.to_string() }),
        ));
        let _ = client.sender.send(frame_text(
            "backendStatus",
            serde_json::json!({ "ok": self.client.breaker_state() == crate::circuit_breaker::BreakerState::Closed }),
        ));

        if was_empty {
            let strategy = self.config.current().subscription.strategy;
            self.subscriptions.ensure_running(strategy).await;
        }
        id
    }

    /// Remove a connection on disconnect, stopping the strategy on the 1→0
    /// transition.
    pub async fn disconnect(&self, id: ClientId) {
        self.clients.remove(&id);
        self.recompute_focus();
        if self.clients.is_empty() {
            self.subscriptions.stop().await;
        }
    }

    pub fn set_focus(&self, id: ClientId, focused: bool) {
        if let Some(client) = self.clients.get(&id) {
            client.focused.store(focused, Ordering::Release);
        }
        self.recompute_focus();
    }

    fn recompute_focus(&self) {
        let any = self.clients.iter().any(|c| c.focused.load(Ordering::Acquire));
        self.any_client_focused.store(any, Ordering::Release);
    }

    /// JSON-encode once and write to every open client; a send failure means
    /// the receiver already hung up and the entry is dropped.
    pub fn broadcast(&self, event: &str, data: Value) {
        let message = frame_text(event, data);
        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().sender.send(message.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            tracing::debug!(client = %id, "dropping broadcast target with closed channel");
            self.clients.remove(&id);
        }
    }

    /// Close every socket owned by `username`, used by the out-of-scope CLI
    /// IPC socket's `user-deleted`/`password-changed` actions (§4.F, §6).
    pub fn disconnect_user(&self, username: &str) {
        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| c.username == username)
            .map(|c| *c.key())
            .collect();
        for id in targets {
            if let Some((_, client)) = self.clients.remove(&id) {
                let _ = client.sender.send(frame_text("account-deleted", Value::Null));
                let _ = client.sender.send(Message::Close(None));
            }
        }
        self.recompute_focus();
    }

    pub fn mark_pong(&self, id: ClientId) {
        if let Some(client) = self.clients.get(&id) {
            client.pending_ping.store(false, Ordering::Release);
        }
    }

    /// 30s liveness sweep: terminate any client whose prior ping went
    /// unacknowledged, else send a fresh ping and mark it pending.
    pub async fn sweep_liveness(&self) {
        let mut terminated = Vec::new();
        for entry in self.clients.iter() {
            let client = entry.value();
            if client.pending_ping.swap(true, Ordering::AcqRel) {
                terminated.push(*entry.key());
            } else if client.sender.send(Message::Ping(Vec::new())).is_err() {
                terminated.push(*entry.key());
            }
        }
        for id in terminated {
            if let Some((_, client)) = self.clients.remove(&id) {
                let _ = client.sender.send(Message::Close(None));
            }
        }
        self.recompute_focus();
    }

    pub fn subscription_context(&self, sink: mpsc::Sender<Vec<crate::state::ItemChange>>) -> SubscriptionContext {
        SubscriptionContext {
            client: self.client.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            sink,
            any_client_focused: self.any_client_focused.clone(),
        }
    }

    /// Handle a client-originated `{event:"fetchDelta", data:{url, since,
    /// requestId}}`, replying on the same socket with `deltaResponse`.
    pub async fn handle_fetch_delta(&self, id: ClientId, url: &str, since: Option<&str>, request_id: &str) {
        let cfg = self.config.current();
        let fetch_path = strip_delta_query_params(url);
        let key = crate::delta::canonical_key(url);

        let result = self.client.get(&cfg.upstream, &fetch_path).await.and_then(|resp| {
            serde_json::from_slice::<PageJson>(&resp.body).map_err(Into::into)
        });

        let payload = match result {
            Ok(page) => {
                let mut group_overrides = std::collections::HashMap::new();
                self.state.apply_group_overrides(&mut group_overrides);
                let snapshot = crate::delta::build_snapshot(&page, &group_overrides);
                let response = self.delta_cache.compute(&key, snapshot, since);
                let mut value = serde_json::to_value(&response).unwrap_or(Value::Null);
                if let Value::Object(ref mut map) = value {
                    map.insert("requestId".to_string(), Value::String(request_id.to_string()));
                }
                value
            }
            Err(e) => serde_json::json!({ "requestId": request_id, "error": e.to_string() }),
        };

        if let Some(client) = self.clients.get(&id) {
            let _ = client.sender.send(frame_text("deltaResponse", payload));
        }
    }

    pub async fn spawn_liveness_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                self.sweep_liveness().await;
            }
        });
    }
}

fn strip_delta_query_params(url: &str) -> String {
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, q),
        None => return format!("{}?type=json", url),
    };
    let mut kept: Vec<String> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            key != "delta" && key != "since"
        })
        .map(String::from)
        .collect();
    if !kept.iter().any(|p| p.starts_with("type=")) {
        kept.push("type=json".to_string());
    }
    format!("{}?{}", path, kept.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_delta_and_since_and_ensures_type_json() {
        let stripped = strip_delta_query_params("rest/sitemaps/home/group?delta=1&since=abc");
        assert_eq!(stripped, "rest/sitemaps/home/group?type=json");
    }

    #[test]
    fn preserves_existing_type_json() {
        let stripped = strip_delta_query_params("rest/sitemaps/home?type=json&delta=1");
        assert_eq!(stripped, "rest/sitemaps/home?type=json");
    }

    #[test]
    fn url_without_query_gains_type_json() {
        assert_eq!(strip_delta_query_params("rest/sitemaps/home"), "rest/sitemaps/home?type=json");
    }
}

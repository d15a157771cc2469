//! Periodic polling strategy: GET `/rest/items` at the focused or
//! background interval depending on whether any connected client is marked
//! focused (design notes §4.D).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{SubscriptionContext, SubscriptionStrategy, TaskSlot};
use crate::state::ItemChange;

#[derive(Deserialize)]
struct ItemEntry {
    name: String,
    state: Option<String>,
}

pub struct PollStrategy {
    slot: Arc<TaskSlot>,
}

impl PollStrategy {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(TaskSlot::new()),
        }
    }
}

impl Default for PollStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionStrategy for PollStrategy {
    async fn start(&self, ctx: SubscriptionContext) {
        let generation = self.slot.restart().await;
        let slot = self.slot.clone();
        let handle = tokio::spawn(async move {
            loop {
                if slot.generation() != generation {
                    return;
                }
                let cfg = ctx.config.current();
                let interval_ms = if ctx.any_client_focused.load(Ordering::Acquire) {
                    cfg.subscription.focused_poll_ms
                } else {
                    cfg.subscription.background_poll_ms
                };
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                if slot.generation() != generation {
                    return;
                }

                let response = ctx.client.get(&cfg.upstream, "rest/items").await;
                if slot.generation() != generation {
                    return;
                }
                let entries: Vec<ItemEntry> = match response {
                    Ok(resp) => match serde_json::from_slice(&resp.body) {
                        Ok(entries) => entries,
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed /rest/items body");
                            continue;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "periodic poll failed");
                        continue;
                    }
                };

                let changes: Vec<ItemChange> = entries
                    .into_iter()
                    .filter_map(|e| e.state.map(|state| ItemChange { name: e.name, state }))
                    .collect();
                let mut emitted = ctx.state.apply_batch(changes);
                let synthetic = ctx
                    .state
                    .recompute_groups(&ctx.client, &cfg.upstream, &emitted)
                    .await;
                emitted.extend(synthetic);
                if !emitted.is_empty() {
                    let _ = ctx.sink.send(emitted).await;
                }
            }
        });
        self.slot.track(handle.abort_handle()).await;
    }

    async fn stop(&self) {
        self.slot.restart().await;
    }

    fn generation(&self) -> u64 {
        self.slot.generation()
    }
}

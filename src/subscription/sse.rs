//! SSE strategy: one long-lived GET to the upstream event stream, with
//! request and socket timeouts disabled, parsing `data: {...}` lines whose
//! nested payload is itself a JSON string (design notes §4.D).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use super::{SubscriptionContext, SubscriptionStrategy, TaskSlot};
use crate::state::ItemChange;

#[derive(Deserialize)]
struct SseEnvelope {
    topic: String,
    payload: Option<String>,
}

#[derive(Deserialize)]
struct SsePayload {
    value: Option<String>,
}

/// `smarthome/items/<name>/statechanged` (or the `openhab/items/...`
/// equivalent) -> `<name>`, tolerant of either prefix.
fn item_name_from_topic(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    let idx = parts.iter().position(|p| *p == "items")?;
    parts.get(idx + 1).copied()
}

pub struct SseStrategy {
    slot: Arc<TaskSlot>,
}

impl SseStrategy {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(TaskSlot::new()),
        }
    }
}

impl Default for SseStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionStrategy for SseStrategy {
    async fn start(&self, ctx: SubscriptionContext) {
        let generation = self.slot.restart().await;
        let slot = self.slot.clone();
        let handle = tokio::spawn(async move {
            loop {
                if slot.generation() != generation {
                    return;
                }
                let cfg = ctx.config.current();
                match ctx.client.open_stream(&cfg.upstream, "rest/events").await {
                    Ok(response) => {
                        if let Err(e) = consume_stream(&ctx, &slot, generation, response).await {
                            tracing::debug!(error = %e, "sse stream ended");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sse connect failed, will retry");
                    }
                }
                if slot.generation() != generation {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(cfg.subscription.reconnect_delay_ms)).await;
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

async fn consume_stream(
    ctx: &SubscriptionContext,
    slot: &Arc<TaskSlot>,
    generation: u64,
    response: reqwest::Response,
) -> Result<(), reqwest::Error> {
    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        if slot.generation() != generation {
            return Ok(());
        }
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line = buffer.drain(..=pos).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            if let Some(change) = parse_event(data.trim()) {
                let cfg = ctx.config.current();
                let mut emitted = ctx.state.apply_batch(vec![change]);
                let synthetic = ctx
                    .state
                    .recompute_groups(&ctx.client, &cfg.upstream, &emitted)
                    .await;
                emitted.extend(synthetic);
                if !emitted.is_empty() {
                    let _ = ctx.sink.send(emitted).await;
                }
            }
        }
    }
    Ok(())
}

fn parse_event(data: &str) -> Option<ItemChange> {
    let envelope: SseEnvelope = serde_json::from_str(data).ok()?;
    let name = item_name_from_topic(&envelope.topic)?.to_string();
    let payload: SsePayload = serde_json::from_str(&envelope.payload?).ok()?;
    Some(ItemChange {
        name,
        state: payload.value?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_item_name_from_statechanged_topic() {
        assert_eq!(
            item_name_from_topic("smarthome/items/Lamp1/statechanged"),
            Some("Lamp1")
        );
        assert_eq!(item_name_from_topic("smarthome/things/x"), None);
    }

    #[test]
    fn parses_nested_payload_into_item_change() {
        let data = r#"{"topic":"smarthome/items/Lamp1/statechanged","payload":"{\"type\":\"OnOff\",\"value\":\"ON\"}"}"#;
        let change = parse_event(data).unwrap();
        assert_eq!(change.name, "Lamp1");
        assert_eq!(change.state, "ON");
    }

    #[test]
    fn malformed_event_is_ignored() {
        assert!(parse_event("{not json").is_none());
    }
}

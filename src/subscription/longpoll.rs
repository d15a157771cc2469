//! Long-polling ("atmosphere") strategy: one in-flight GET per discovered
//! sitemap page, reconnecting immediately on completion and after a fixed
//! delay on error, with a no-update watchdog (design notes §4.D).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::{collect_item_changes, SubscriptionContext, SubscriptionStrategy, TaskSlot};
use crate::upstream::model::{PageJson, WidgetJson};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn discover_from_widget(widget: &WidgetJson, out: &mut Vec<String>) {
    if let Some(linked) = &widget.linkedPage {
        if let Some(id) = &linked.id {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
    }
    for child in &widget.widget {
        discover_from_widget(child, out);
    }
}

/// Walk `linkedPage.id`, `widget`/`widgets`, and `homepage` to find every
/// page id reachable from the root sitemap response.
fn discover_page_ids(page: &PageJson, out: &mut Vec<String>) {
    if let Some(id) = &page.id {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    for widget in &page.widget {
        discover_from_widget(widget, out);
    }
    if let Some(home) = &page.homepage {
        discover_page_ids(home, out);
    }
}

pub struct LongPollStrategy {
    slot: Arc<TaskSlot>,
    last_update: Arc<AtomicI64>,
    watchdog_warned: Arc<AtomicBool>,
}

impl LongPollStrategy {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(TaskSlot::new()),
            last_update: Arc::new(AtomicI64::new(now_secs())),
            watchdog_warned: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for LongPollStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionStrategy for LongPollStrategy {
    async fn start(&self, ctx: SubscriptionContext) {
        let generation = self.slot.restart().await;
        self.last_update.store(now_secs(), Ordering::Release);
        self.watchdog_warned.store(false, Ordering::Release);

        let slot = self.slot.clone();
        let last_update = self.last_update.clone();
        let watchdog_warned = self.watchdog_warned.clone();
        let discovery_ctx = ctx.clone();
        let supervisor = tokio::spawn(async move {
            let cfg = discovery_ctx.config.current();
            let sitemap_name = cfg.subscription.sitemap_name.clone();
            let root: PageJson = match discovery_ctx
                .client
                .get(&cfg.upstream, &format!("rest/sitemaps/{}?type=json", sitemap_name))
                .await
                .and_then(|resp| serde_json::from_slice(&resp.body).map_err(Into::into))
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(error = %e, "sitemap discovery failed, falling back to root page only");
                    PageJson {
                        id: Some(sitemap_name.clone()),
                        ..Default::default()
                    }
                }
            };

            let mut page_ids = Vec::new();
            discover_page_ids(&root, &mut page_ids);
            if page_ids.is_empty() {
                page_ids.push(sitemap_name.clone());
            }

            for page_id in page_ids {
                if slot.generation() != generation {
                    return;
                }
                let page_ctx = discovery_ctx.clone();
                let page_slot = slot.clone();
                let page_last_update = last_update.clone();
                let page_sitemap = sitemap_name.clone();
                let handle = tokio::spawn(run_page_loop(
                    page_ctx,
                    page_slot,
                    generation,
                    page_sitemap,
                    page_id,
                    page_last_update,
                ));
                slot.track(handle.abort_handle()).await;
            }
        });
        self.slot.track(supervisor.abort_handle()).await;

        let watchdog_slot = self.slot.clone();
        let watchdog_last_update = self.last_update.clone();
        let watchdog_threshold = ctx.config.current().subscription.no_update_watchdog_secs as i64;
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if watchdog_slot.generation() != generation {
                    return;
                }
                let elapsed = now_secs() - watchdog_last_update.load(Ordering::Acquire);
                if elapsed >= watchdog_threshold {
                    if !watchdog_warned.swap(true, Ordering::AcqRel) {
                        tracing::warn!(elapsed_secs = elapsed, "no item update observed within watchdog threshold");
                    }
                } else {
                    watchdog_warned.store(false, Ordering::Release);
                }
            }
        });
        self.slot.track(watchdog.abort_handle()).await;
    }

    async fn stop(&self) {
        self.slot.restart().await;
    }

    fn generation(&self) -> u64 {
        self.slot.generation()
    }
}

async fn run_page_loop(
    ctx: SubscriptionContext,
    slot: Arc<TaskSlot>,
    generation: u64,
    sitemap_name: String,
    page_id: String,
    last_update: Arc<AtomicI64>,
) {
    let mut tracking_id: Option<String> = None;
    loop {
        if slot.generation() != generation {
            return;
        }
        let cfg = ctx.config.current();
        let path = format!("rest/sitemaps/{}/{}?type=json", sitemap_name, page_id);
        let headers: Vec<(&str, String)> = tracking_id
            .as_ref()
            .map(|id| vec![("X-Atmosphere-tracking-id", id.clone())])
            .unwrap_or_default();
        let timeout = Duration::from_secs(cfg.subscription.long_poll_timeout_secs);

        let response = ctx
            .client
            .get_with_timeout(&cfg.upstream, &path, &headers, Some(timeout))
            .await;

        if slot.generation() != generation {
            return;
        }

        match response {
            Ok(resp) => {
                let page: Result<PageJson, _> = serde_json::from_slice(&resp.body);
                if let Ok(page) = page {
                    let mut changes = Vec::new();
                    collect_item_changes(&page.widget, &mut changes);
                    if !changes.is_empty() {
                        last_update.store(now_secs(), Ordering::Release);
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
                }
                tracking_id = resp.tracking_id;
            }
            Err(e) => {
                tracing::debug!(page = %page_id, error = %e, "long-poll request failed, will retry");
                tokio::time::sleep(Duration::from_millis(cfg.subscription.reconnect_delay_ms)).await;
            }
        }
    }
}

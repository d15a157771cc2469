//! Pluggable source of item-state deltas: long-polling per page, an SSE
//! event stream, or periodic `/items` polling, unified behind one trait and
//! swapped in place as clients connect/disconnect or configuration reloads
//! (design notes §4.D).

pub mod longpoll;
pub mod poll;
pub mod sse;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

use crate::config::{ConfigWatcher, SubscriptionStrategyKind};
use crate::state::SharedStateDetector;
use crate::upstream::UpstreamClient;

pub type ChangeSink = mpsc::Sender<Vec<crate::state::ItemChange>>;

/// Shared handles every strategy needs; cheap to clone, all internally
/// `Arc`-backed.
#[derive(Clone)]
pub struct SubscriptionContext {
    pub client: Arc<UpstreamClient>,
    pub config: Arc<ConfigWatcher>,
    pub state: SharedStateDetector,
    pub sink: ChangeSink,
    /// Set by the WebSocket hub whenever at least one connected client is
    /// focused; read by the polling strategy to pick its interval.
    pub any_client_focused: Arc<AtomicBool>,
}

#[async_trait]
pub trait SubscriptionStrategy: Send + Sync {
    async fn start(&self, ctx: SubscriptionContext);
    async fn stop(&self);
    fn generation(&self) -> u64;
}

/// A restartable background task plus the generation counter that lets a
/// late-returning callback recognize it has been superseded (design notes
/// §5 "Subscription generation counter").
pub(crate) struct TaskSlot {
    pub generation: AtomicU64,
    pub handles: Mutex<Vec<AbortHandle>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bump the generation and abort every tracked task; returns the new
    /// generation for the caller's fresh spawns to carry.
    pub async fn restart(&self) -> u64 {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub async fn track(&self, handle: AbortHandle) {
        self.handles.lock().await.push(handle);
    }
}

/// Owns exactly one live strategy, swapped only from the single task that
/// handles WebSocket connect/disconnect and config reload (design notes
/// §4.D); this avoids concurrent start/stop races under cooperative
/// scheduling.
pub struct SubscriptionManager {
    current: Mutex<Option<(SubscriptionStrategyKind, Arc<dyn SubscriptionStrategy>)>>,
    ctx: SubscriptionContext,
}

impl SubscriptionManager {
    pub fn new(ctx: SubscriptionContext) -> Self {
        Self {
            current: Mutex::new(None),
            ctx,
        }
    }

    fn build(kind: SubscriptionStrategyKind) -> Arc<dyn SubscriptionStrategy> {
        match kind {
            SubscriptionStrategyKind::LongPolling => Arc::new(longpoll::LongPollStrategy::new()),
            SubscriptionStrategyKind::Sse => Arc::new(sse::SseStrategy::new()),
            SubscriptionStrategyKind::Polling => Arc::new(poll::PollStrategy::new()),
        }
    }

    /// Ensure a strategy matching `kind` is running, starting or swapping it
    /// if necessary. Idempotent if the same kind is already live.
    pub async fn ensure_running(&self, kind: SubscriptionStrategyKind) {
        let mut current = self.current.lock().await;
        if let Some((running_kind, _)) = current.as_ref() {
            if *running_kind == kind {
                return;
            }
        }
        if let Some((_, old)) = current.take() {
            old.stop().await;
        }
        let strategy = Self::build(kind);
        strategy.start(self.ctx.clone()).await;
        *current = Some((kind, strategy));
    }

    pub async fn stop(&self) {
        let mut current = self.current.lock().await;
        if let Some((_, strategy)) = current.take() {
            strategy.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

/// Recursively collect `{item: {name, state}}` leaves out of a widget tree,
/// shared by the long-polling and periodic-polling strategies.
pub(crate) fn collect_item_changes(
    widgets: &[crate::upstream::model::WidgetJson],
    out: &mut Vec<crate::state::ItemChange>,
) {
    for widget in widgets {
        if let Some(item) = &widget.item {
            if let (Some(name), Some(state)) = (&item.name, &item.state) {
                out.push(crate::state::ItemChange {
                    name: name.clone(),
                    state: state.clone(),
                });
            }
        }
        collect_item_changes(&widget.widget, out);
    }
}

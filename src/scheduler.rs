//! Named periodic tasks: sitemap cache refresh, auth-lockout pruning, and
//! stale-session cleanup, each re-entry-guarded and live-rescheduled on a
//! config reload (design notes §4.I).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::AbortHandle;

use crate::config::ConfigWatcher;
use crate::state::SharedStateDetector;
use crate::AppState;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Tracks when a named task last completed, so a future persistence backend
/// (database, file) can be swapped in without touching the scheduler loop.
pub trait LastRunStore: Send + Sync {
    fn record(&self, task: &str, at_unix_secs: i64);
    fn last_run(&self, task: &str) -> Option<i64>;
}

pub struct InMemoryLastRunStore {
    runs: dashmap::DashMap<String, i64>,
}

impl InMemoryLastRunStore {
    pub fn new() -> Self {
        Self {
            runs: dashmap::DashMap::new(),
        }
    }
}

impl Default for InMemoryLastRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LastRunStore for InMemoryLastRunStore {
    fn record(&self, task: &str, at_unix_secs: i64) {
        self.runs.insert(task.to_string(), at_unix_secs);
    }

    fn last_run(&self, task: &str) -> Option<i64> {
        self.runs.get(task).map(|v| *v)
    }
}

/// Runs `{name, intervalMs}` loops against the live config, restarting each
/// task's timer when its configured interval changes on a hot reload. Each
/// task carries a re-entry guard so an overlapping run is skipped, not
/// queued.
pub struct Scheduler {
    store: Arc<dyn LastRunStore>,
    handles: Vec<AbortHandle>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn LastRunStore>) -> Self {
        Self {
            store,
            handles: Vec::new(),
        }
    }

    /// Spawn the three core tasks against `state`. Each loop reads the
    /// current interval from `config` on every tick, so a reload takes
    /// effect on the task's next wakeup without a restart.
    pub fn start(&mut self, app: AppState) {
        self.handles.push(spawn_task(
            "sitemap-cache-refresh",
            self.store.clone(),
            app.config.clone(),
            |cfg| Duration::from_millis(cfg.scheduler.sitemap_refresh_ms),
            {
                let app = app.clone();
                move || {
                    let app = app.clone();
                    async move { refresh_sitemap_cache(&app).await }
                }
            },
        ));

        self.handles.push(spawn_task(
            "auth-lockout-prune",
            self.store.clone(),
            app.config.clone(),
            |cfg| Duration::from_millis(cfg.scheduler.lockout_prune_ms),
            {
                let auth = app.auth.clone();
                move || {
                    let auth = auth.clone();
                    async move {
                        auth.lockout.prune();
                    }
                }
            },
        ));

        self.handles.push(spawn_task(
            "session-cleanup",
            self.store.clone(),
            app.config.clone(),
            |cfg| Duration::from_millis(cfg.scheduler.session_cleanup_ms),
            {
                let state = app.state.clone();
                let config = app.config.clone();
                move || {
                    let state = state.clone();
                    let config = config.clone();
                    async move {
                        let window = Duration::from_secs(config.current().auth.stale_window_secs);
                        prune_stale_sessions(&state, window)
                    }
                }
            },
        ));
    }

    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn refresh_sitemap_cache(app: &AppState) {
    let cfg = app.config.current();
    let path = format!("rest/sitemaps/{}?type=json", cfg.subscription.sitemap_name);
    match app.client.get(&cfg.upstream, &path).await {
        Ok(resp) => {
            if let Ok(page) = serde_json::from_slice::<crate::upstream::model::PageJson>(&resp.body) {
                let mut overrides = std::collections::HashMap::new();
                app.state.apply_group_overrides(&mut overrides);
                let snapshot = crate::delta::build_snapshot(&page, &overrides);
                let key = crate::delta::canonical_key(&cfg.subscription.sitemap_name);
                app.delta_cache.compute(&key, snapshot, None);
            }
        }
        Err(e) => tracing::warn!(error = %e, "scheduled sitemap cache refresh failed"),
    }
}

fn prune_stale_sessions(state: &SharedStateDetector, window: Duration) {
    state.prune_stale(window);
}

/// Spawn a single re-entry-guarded loop. `interval_of` is re-read from the
/// live config on every tick so a hot reload changes the cadence in place.
fn spawn_task<F, Fut>(
    name: &'static str,
    store: Arc<dyn LastRunStore>,
    config: Arc<ConfigWatcher>,
    interval_of: impl Fn(&crate::config::RelayConfig) -> Duration + Send + 'static,
    run: F,
) -> AbortHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let running = Arc::new(AtomicBool::new(false));
    let last_tick = Arc::new(AtomicI64::new(now_secs()));

    let task = tokio::spawn(async move {
        let initial_interval = interval_of(&config.current());
        let elapsed_since_last_run = store
            .last_run(name)
            .map(|at| Duration::from_secs((now_secs() - at).max(0) as u64))
            .unwrap_or(initial_interval);
        let first_delay = initial_interval.saturating_sub(elapsed_since_last_run);
        tokio::time::sleep(first_delay).await;

        loop {
            // A run is never actually concurrent with itself in this loop
            // (each iteration awaits the prior one to completion), but the
            // flag still protects against a future change that spawns `run`
            // fire-and-forget instead of awaiting it.
            if !running.swap(true, Ordering::AcqRel) {
                run().await;
                store.record(name, now_secs());
                last_tick.store(now_secs(), Ordering::Release);
                running.store(false, Ordering::Release);
            } else {
                tracing::debug!(task = name, "skipping overlapping scheduled run");
            }
            tokio::time::sleep(interval_of(&config.current())).await;
        }
    });
    task.abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_records_and_reads_last_run() {
        let store = InMemoryLastRunStore::new();
        assert!(store.last_run("sitemap-cache-refresh").is_none());
        store.record("sitemap-cache-refresh", 1_000);
        assert_eq!(store.last_run("sitemap-cache-refresh"), Some(1_000));
    }
}

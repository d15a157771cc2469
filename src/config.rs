//! Live configuration: a single immutable snapshot rebuilt atomically on
//! reload. Components read `config.load()` at use site; nobody caches an
//! individual field across an await point (see design notes §4.A, §9).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{RelayError, RelayResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenConfig {
    pub http_addr: Option<String>,
    /// Accepted for a TLS terminator placed in front of this process; this
    /// binary itself only ever binds `http_addr`.
    pub https_addr: Option<String>,
    pub http2: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            http_addr: Some("0.0.0.0:8080".to_string()),
            https_addr: None,
            http2: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub basic_user: Option<String>,
    pub basic_pass: Option<String>,
    pub timeout_ms: u64,
    pub max_redirects: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            bearer_token: None,
            basic_user: None,
            basic_pass: None,
            timeout_ms: 15_000,
            max_redirects: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    pub cookie_secret: String,
    pub lockout_threshold: u32,
    pub lockout_minutes: u64,
    pub notify_throttle_minutes: u64,
    pub stale_window_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_secret: "change-me-in-production".to_string(),
            lockout_threshold: 3,
            lockout_minutes: 15,
            notify_throttle_minutes: 10,
            stale_window_secs: 3600,
        }
    }
}

/// Socket-level admission control, checked before lockout/auth (design
/// notes §4.F). `allowed_subnets` empty means "no subnet restriction";
/// `denied_forwarded_for` is only consulted when `trust_proxy_headers` is
/// set, since an untrusted `X-Forwarded-For` is attacker-controlled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkAccessConfig {
    pub allowed_subnets: Vec<String>,
    pub denied_forwarded_for: Vec<String>,
    pub trust_proxy_headers: bool,
}

impl Default for NetworkAccessConfig {
    fn default() -> Self {
        Self {
            allowed_subnets: Vec::new(),
            denied_forwarded_for: Vec::new(),
            trust_proxy_headers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaCacheConfig {
    pub max_keys: usize,
    pub history_per_key: usize,
}

impl Default for DeltaCacheConfig {
    fn default() -> Self {
        Self {
            max_keys: 256,
            history_per_key: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy)]
pub enum SubscriptionStrategyKind {
    LongPolling,
    Sse,
    Polling,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub strategy: SubscriptionStrategyKind,
    pub sitemap_name: String,
    pub focused_poll_ms: u64,
    pub background_poll_ms: u64,
    pub no_update_watchdog_secs: u64,
    pub long_poll_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    pub group_items: Vec<String>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            strategy: SubscriptionStrategyKind::Polling,
            sitemap_name: "home".to_string(),
            focused_poll_ms: 2_000,
            background_poll_ms: 10_000,
            no_update_watchdog_secs: 5,
            long_poll_timeout_secs: 120,
            reconnect_delay_ms: 2_000,
            group_items: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    pub sitemap_refresh_ms: u64,
    pub lockout_prune_ms: u64,
    pub session_cleanup_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sitemap_refresh_ms: 60_000,
            lockout_prune_ms: 60_000,
            session_cleanup_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { file: None }
    }
}

/// A single immutable configuration snapshot. Every field here is rebound
/// atomically on a successful reload; no component is allowed to hold on to
/// an individual field across an `.await` — only the whole `Arc<RelayConfig>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RelayConfig {
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub network_access: NetworkAccessConfig,
    pub delta_cache: DeltaCacheConfig,
    pub subscription: SubscriptionConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl RelayConfig {
    pub fn load(path: &Path) -> RelayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::ConfigInvalid(vec![format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            )])
        })?;
        let config: RelayConfig = toml::from_str(&content).map_err(|e| {
            RelayError::ConfigInvalid(vec![format!("failed to parse config file: {}", e)])
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Collect every violation rather than bailing on the first, so a
    /// startup failure is fully actionable in one read (design notes §7).
    pub fn validate(&self) -> RelayResult<()> {
        let mut violations = Vec::new();

        // `main.rs` only binds `listen.http_addr`; `https_addr` is accepted
        // as a passthrough value for a future TLS terminator in front of this
        // process but isn't bound by this binary, so a deployment can't rely
        // on it alone to serve traffic.
        if self.listen.http_addr.is_none() {
            violations.push("listen.http_addr must be set".to_string());
        }
        if self.upstream.base_url.is_empty() {
            violations.push("upstream.base_url must not be empty".to_string());
        }
        if self.auth.cookie_secret.is_empty() {
            violations.push("auth.cookie_secret must not be empty".to_string());
        }
        if self.delta_cache.history_per_key == 0 {
            violations.push("delta_cache.history_per_key must be >= 1".to_string());
        }
        if self.delta_cache.history_per_key > 5 {
            violations.push("delta_cache.history_per_key must be <= 5".to_string());
        }
        for raw in &self.network_access.allowed_subnets {
            if raw.parse::<ipnet::IpNet>().is_err() {
                violations.push(format!("network_access.allowed_subnets entry is not a valid CIDR: {}", raw));
            }
        }
        for raw in &self.network_access.denied_forwarded_for {
            if raw.parse::<ipnet::IpNet>().is_err() {
                violations.push(format!("network_access.denied_forwarded_for entry is not a valid CIDR: {}", raw));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(RelayError::ConfigInvalid(violations))
        }
    }

    /// Fields that require a process restart to take effect; diverging on
    /// these schedules a clean exit rather than a hot swap.
    fn restart_required_diverges(&self, other: &RelayConfig) -> bool {
        self.listen != other.listen || self.logging != other.logging
    }
}

/// Watches the config file's mtime and republishes a fresh snapshot when it
/// changes. Callers poll this at the top of every request (a cheap `stat`);
/// a failed reload logs and keeps serving the previous snapshot.
pub struct ConfigWatcher {
    path: PathBuf,
    current: ArcSwap<RelayConfig>,
    last_mtime: AtomicI64,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, initial: RelayConfig) -> Self {
        let mtime = mtime_secs(&path).unwrap_or(0);
        Self {
            path,
            current: ArcSwap::from_pointee(initial),
            last_mtime: AtomicI64::new(mtime),
        }
    }

    pub fn current(&self) -> Arc<RelayConfig> {
        self.current.load_full()
    }

    /// Stat the backing file; if its mtime advanced, attempt a reload. On
    /// success returns `true` and a restart may have been scheduled if a
    /// restart-required field diverged. On parse/validation failure, logs a
    /// warning and leaves the previous snapshot intact.
    pub fn poll(&self) -> bool {
        let mtime = match mtime_secs(&self.path) {
            Some(m) => m,
            None => return false,
        };
        if mtime <= self.last_mtime.load(Ordering::Acquire) {
            return false;
        }
        self.last_mtime.store(mtime, Ordering::Release);

        match RelayConfig::load(&self.path) {
            Ok(new_config) => {
                let old = self.current.load_full();
                if old.restart_required_diverges(&new_config) {
                    tracing::error!(
                        "restart-required configuration changed (listen/logging); scheduling exit"
                    );
                    self.current.store(Arc::new(new_config));
                    tokio::spawn(async {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        std::process::exit(0);
                    });
                    true
                } else {
                    self.current.store(Arc::new(new_config));
                    tracing::info!("configuration reloaded");
                    true
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "configuration reload failed, keeping previous snapshot");
                false
            }
        }
    }
}

fn mtime_secs(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let dur = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    Some(dur.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_no_http_listener_even_with_https_set() {
        let mut cfg = RelayConfig::default();
        cfg.listen.http_addr = None;
        cfg.listen.https_addr = Some("0.0.0.0:8443".to_string());
        let err = cfg.validate().unwrap_err();
        match err {
            RelayError::ConfigInvalid(violations) => {
                assert!(violations.iter().any(|v| v.contains("http_addr")));
            }
            _ => panic!("expected ConfigInvalid"),
        }
    }

    #[test]
    fn rejects_malformed_allowed_subnet() {
        let mut cfg = RelayConfig::default();
        cfg.network_access.allowed_subnets.push("not-a-cidr".to_string());
        let err = cfg.validate().unwrap_err();
        match err {
            RelayError::ConfigInvalid(violations) => {
                assert!(violations.iter().any(|v| v.contains("allowed_subnets")));
            }
            _ => panic!("expected ConfigInvalid"),
        }
    }

    #[test]
    fn rejects_history_depth_above_five() {
        let mut cfg = RelayConfig::default();
        cfg.delta_cache.history_per_key = 6;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn restart_required_fields_detected() {
        let a = RelayConfig::default();
        let mut b = a.clone();
        b.listen.http_addr = Some("0.0.0.0:9090".to_string());
        assert!(a.restart_required_diverges(&b));

        let mut c = a.clone();
        c.subscription.focused_poll_ms = 500;
        assert!(!a.restart_required_diverges(&c));
    }
}

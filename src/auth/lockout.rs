//! Per-source-key failure counting with time-bounded lockout, plus a
//! throttled failure-notification gate (design notes §4.B, §9).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Entry {
    fail_count: u32,
    lock_until: i64,
    last_fail_at: i64,
}

pub struct LockoutTracker {
    entries: DashMap<String, Entry>,
    threshold: u32,
    lock_secs: i64,
    stale_window_secs: i64,
    last_notify: AtomicI64,
    notify_throttle_secs: i64,
}

impl LockoutTracker {
    pub fn new(threshold: u32, lock_minutes: u64, stale_window_secs: u64, notify_throttle_minutes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            threshold,
            lock_secs: (lock_minutes * 60) as i64,
            stale_window_secs: stale_window_secs as i64,
            last_notify: AtomicI64::new(0),
            notify_throttle_secs: (notify_throttle_minutes * 60) as i64,
        }
    }

    /// The configured lockout duration, used by callers that need to report
    /// `retry_after_secs` for the attempt that just crossed the threshold
    /// (before `lock_until` would otherwise be consulted via `check`).
    pub fn lock_secs(&self) -> u64 {
        self.lock_secs as u64
    }

    /// `Some(retry_after_secs)` if `key` is currently locked out; while
    /// locked, callers must reject the attempt without checking credentials.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = now_secs();
        let entry = self.entries.get(key)?;
        if entry.lock_until > now {
            Some((entry.lock_until - now) as u64)
        } else {
            None
        }
    }

    /// Records a failed attempt; returns `true` if this failure newly
    /// crossed the lockout threshold (used to decide whether to notify).
    pub fn record_failure(&self, key: &str) -> bool {
        let now = now_secs();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            fail_count: 0,
            lock_until: 0,
            last_fail_at: now,
        });
        entry.fail_count += 1;
        entry.last_fail_at = now;
        let just_locked = entry.fail_count >= self.threshold && entry.lock_until <= now;
        if just_locked {
            entry.lock_until = now + self.lock_secs;
        }
        just_locked
    }

    /// Resets the counter on a successful auth.
    pub fn record_success(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Whether a throttled failure notification should fire now; if so,
    /// atomically claims the slot so concurrent failures don't double-fire.
    pub fn maybe_notify(&self) -> bool {
        let now = now_secs();
        let last = self.last_notify.load(Ordering::Acquire);
        if now - last < self.notify_throttle_secs {
            return false;
        }
        self.last_notify
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Evicts entries that are neither locked nor recently active (design
    /// notes §5 "Lockout map"); run every 60s by the scheduler.
    pub fn prune(&self) {
        let now = now_secs();
        self.entries.retain(|_, entry| {
            entry.lock_until > now || now - entry.last_fail_at <= self.stale_window_secs
        });
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Parse `Authorization: Basic <base64(user:pass)>`. A malformed header is
/// treated as simply unauthenticated, not an error (design notes §4.B).
pub fn parse_basic_auth(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_failures_lock_and_reset_on_success() {
        let tracker = LockoutTracker::new(3, 15, 3600, 10);
        assert!(tracker.check("1.2.3.4").is_none());
        tracker.record_failure("1.2.3.4");
        tracker.record_failure("1.2.3.4");
        let just_locked = tracker.record_failure("1.2.3.4");
        assert!(just_locked);
        assert!(tracker.check("1.2.3.4").is_some());

        tracker.record_success("1.2.3.4");
        assert!(tracker.check("1.2.3.4").is_none());
    }

    #[test]
    fn prune_keeps_locked_entries() {
        let tracker = LockoutTracker::new(1, 15, 0, 10);
        tracker.record_failure("a");
        assert_eq!(tracker.entry_count(), 1);
        tracker.prune();
        assert_eq!(tracker.entry_count(), 1, "locked entries survive pruning");
    }

    #[test]
    fn prune_drops_stale_unlocked_entries() {
        let tracker = LockoutTracker::new(10, 15, 0, 10);
        tracker.record_failure("a");
        tracker.prune();
        assert_eq!(tracker.entry_count(), 0);
    }

    #[test]
    fn notify_throttled_to_one_per_window() {
        let tracker = LockoutTracker::new(3, 15, 3600, 10);
        assert!(tracker.maybe_notify());
        assert!(!tracker.maybe_notify());
    }

    #[test]
    fn parses_valid_basic_header() {
        let header = format!(
            "Basic {}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"alice:s3cret")
        );
        let (user, pass) = parse_basic_auth(&header).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");
    }

    #[test]
    fn malformed_header_is_none_not_error() {
        assert!(parse_basic_auth("Bearer xyz").is_none());
        assert!(parse_basic_auth("Basic not-base64!!").is_none());
    }
}

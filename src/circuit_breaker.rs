//! Failure-counting circuit breaker guarding calls to a degraded upstream.
//!
//! Grounded on the teacher's `SidecarCircuitBreaker`/`CircuitBreakerRegistry`
//! shape, adapted from a per-gRPC-endpoint keying to a single breaker per
//! upstream base URL (design notes §7).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout_secs: u64,
    consecutive_failures: AtomicU32,
    opened_at: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            reset_timeout_secs,
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        if opened_at == 0 {
            return BreakerState::Closed;
        }
        if now_secs() - opened_at >= self.reset_timeout_secs {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Whether a call may proceed right now. A half-open breaker allows
    /// exactly one probe through by optimistically resetting `opened_at` to
    /// zero the first time this is polled after the reset window elapses;
    /// the caller reports the outcome via `record_success`/`record_failure`.
    pub fn allow(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                self.opened_at.store(0, Ordering::Release);
                true
            }
            BreakerState::Open => false,
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at.store(0, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold && self.opened_at.load(Ordering::Acquire) == 0 {
            self.opened_at.store(now_secs(), Ordering::Release);
            tracing::warn!(failures, "circuit breaker opened");
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_until_threshold_reached() {
        let cb = CircuitBreaker::new(3, 60);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new(3, 60);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_reset_timeout() {
        let cb = CircuitBreaker::new(1, 0);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.allow());
    }
}

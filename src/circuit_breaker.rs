//! Reusable Closed/Open/Half-Open circuit breaker shared by every
//! processing strategy that wraps a fallible backend (spec.md §4.3).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Trips after `failure_threshold` consecutive failures, stays open for
/// `cooldown_period`, then allows one probe; after
/// `probe_successes_needed` consecutive successes it resets to closed.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown_period_secs: f64,
    probe_successes_needed: u32,
    failure_count: AtomicU32,
    consecutive_successes: AtomicU32,
    tripped: std::sync::atomic::AtomicBool,
    last_failure_time: AtomicU64,
    // serializes the half-open probe decision so only one caller at a
    // time is allowed through during cooldown.
    probe_gate: Mutex<()>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 30.0, 5)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_period_secs: f64, probe_successes_needed: u32) -> Self {
        Self {
            failure_threshold,
            cooldown_period_secs,
            probe_successes_needed,
            failure_count: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            tripped: std::sync::atomic::AtomicBool::new(false),
            last_failure_time: AtomicU64::new(0),
            probe_gate: Mutex::new(()),
        }
    }

    pub fn record_success(&self) {
        if !self.tripped.load(Ordering::Acquire) {
            self.failure_count.store(0, Ordering::Release);
            return;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= self.probe_successes_needed {
            self.tripped.store(false, Ordering::Release);
            self.failure_count.store(0, Ordering::Release);
            self.consecutive_successes.store(0, Ordering::Release);
        }
    }

    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_time.store(now_secs(), Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);

        if count >= self.failure_threshold {
            self.tripped.store(true, Ordering::Release);
        }
    }

    /// Whether a caller may attempt the guarded operation right now. In
    /// the half-open window only one probe is let through at a time.
    pub fn is_available(&self) -> bool {
        if !self.tripped.load(Ordering::Acquire) {
            return true;
        }

        let elapsed = now_secs().saturating_sub(self.last_failure_time.load(Ordering::Acquire));
        if (elapsed as f64) > self.cooldown_period_secs {
            self.probe_gate.try_lock().is_some()
        } else {
            false
        }
    }

    pub fn state(&self) -> BreakerState {
        if !self.tripped.load(Ordering::Acquire) {
            BreakerState::Closed
        } else if self.is_available() {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_failure_threshold() {
        let breaker = CircuitBreaker::new(3, 30.0, 5);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_available());
    }

    #[test]
    fn resets_after_success_while_closed() {
        let breaker = CircuitBreaker::new(3, 30.0, 5);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn half_open_allows_single_probe_after_cooldown() {
        let breaker = CircuitBreaker::new(1, 0.0, 1);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.is_available());
    }

    #[test]
    fn resets_after_enough_probe_successes() {
        let breaker = CircuitBreaker::new(1, 0.0, 2);
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}

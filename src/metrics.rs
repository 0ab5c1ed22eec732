//! Bus-level metrics aggregation (spec.md §4.1's `GetMetrics`/
//! `GetMetricsAsync`).
//!
//! Grounded on `agent_bus.py`'s `get_metrics`/`get_metrics_async`: a
//! flat counter set, augmented with whatever the processor and policy
//! client report. The original merges the processor's dict into the
//! same flat namespace, non-overwriting for keys already present; here
//! `processor_metrics` stays a distinct typed field instead of a
//! dynamic merge (see DESIGN.md) — the observable counter values are
//! unchanged, only the shape is.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::processor::ProcessorMetrics;
use crate::CONSTITUTIONAL_HASH;

/// Atomic counters the bus updates as it handles traffic. `sent`/
/// `received` count attempts; `messages_sent`/`messages_received`/
/// `messages_failed` count outcomes (spec.md §9's open question on the
/// attempts-vs-outcomes distinction).
#[derive(Debug, Default)]
pub struct BusMetrics {
    sent: AtomicU64,
    messages_sent: AtomicU64,
    received: AtomicU64,
    messages_received: AtomicU64,
    failed: AtomicU64,
    messages_failed: AtomicU64,
    dropped: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn messages_failed(&self) -> u64 {
        self.messages_failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The full metrics snapshot returned by `EnhancedAgentBus::get_metrics`
/// and `get_metrics_async` (spec.md §4.1).
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub messages_sent: u64,
    pub received: u64,
    pub messages_received: u64,
    pub failed: u64,
    pub messages_failed: u64,
    pub dropped: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub agents: usize,
    pub registered_agents: usize,
    pub queue_size: usize,
    pub is_running: bool,
    pub metering_enabled: bool,
    pub circuit_breaker_health: String,
    pub policy_registry_status: Option<String>,
    pub fallback_reason: Option<String>,
    pub constitutional_hash: String,
    pub processor_metrics: ProcessorMetrics,
}

impl MetricsSnapshot {
    /// Base snapshot with every field the bus can compute
    /// synchronously; `policy_registry_status` is filled in separately
    /// by `get_metrics_async`, which has to await a health check.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        counters: &BusMetrics,
        started_at: Option<DateTime<Utc>>,
        agents: usize,
        queue_size: usize,
        is_running: bool,
        metering_enabled: bool,
        circuit_breaker_health: String,
        fallback_reason: Option<String>,
        processor_metrics: ProcessorMetrics,
    ) -> Self {
        Self {
            sent: counters.sent(),
            messages_sent: counters.messages_sent(),
            received: counters.received(),
            messages_received: counters.messages_received(),
            failed: counters.failed(),
            messages_failed: counters.messages_failed(),
            dropped: counters.dropped(),
            started_at,
            agents,
            registered_agents: agents,
            queue_size,
            is_running,
            metering_enabled,
            circuit_breaker_health,
            policy_registry_status: None,
            fallback_reason,
            constitutional_hash: CONSTITUTIONAL_HASH.to_string(),
            processor_metrics,
        }
    }
}

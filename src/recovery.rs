//! Service recovery orchestration (spec.md §4.9): schedules retries
//! for a degraded dependency under a backoff policy and tracks
//! outcomes, independent of the message-level circuit breaker in
//! `circuit_breaker.rs`.
//!
//! Grounded on `recovery_orchestrator.py`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::{BusError, BusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    Immediate,
    Manual,
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_retry_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self { max_retry_attempts: 5, backoff_multiplier: 2.0, initial_delay_ms: 1000, max_delay_ms: 60_000 }
    }
}

impl RecoveryPolicy {
    /// Validates the policy's numeric invariants, mirroring the
    /// construction-time checks the original enforces in its
    /// constructor.
    pub fn validate(&self) -> BusResult<()> {
        if self.max_retry_attempts < 1 {
            return Err(BusError::Configuration("max_retry_attempts must be >= 1".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(BusError::Configuration("backoff_multiplier must be >= 1.0".into()));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(BusError::Configuration("max_delay_ms must be >= initial_delay_ms".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub service_name: String,
    pub success: bool,
    pub attempt_number: u32,
    pub total_attempts: u32,
    pub elapsed: Duration,
    pub state: RecoveryState,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

struct RecoveryTask {
    service_name: String,
    strategy: RecoveryStrategy,
    policy: RecoveryPolicy,
    attempt_count: u32,
    state: RecoveryState,
    next_attempt_at: DateTime<Utc>,
}

/// Min-heap entry ordered by `next_attempt_at`; `BinaryHeap` is a
/// max-heap so the comparison is reversed to pop the earliest attempt
/// first.
struct ScheduledAttempt {
    next_attempt_at: DateTime<Utc>,
    service_name: String,
}

impl PartialEq for ScheduledAttempt {
    fn eq(&self, other: &Self) -> bool {
        self.next_attempt_at == other.next_attempt_at
    }
}
impl Eq for ScheduledAttempt {}
impl PartialOrd for ScheduledAttempt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledAttempt {
    fn cmp(&self, other: &Self) -> Ordering {
        other.next_attempt_at.cmp(&self.next_attempt_at)
    }
}

type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync>;

struct RecoveryInner {
    tasks: HashMap<String, RecoveryTask>,
    queue: BinaryHeap<ScheduledAttempt>,
    history: Vec<RecoveryResult>,
    health_checks: HashMap<String, HealthCheck>,
}

/// Schedules and drives recovery attempts for degraded services under
/// one of four backoff strategies, keeping a bounded history of past
/// attempts for status reporting.
pub struct RecoveryOrchestrator {
    default_policy: RecoveryPolicy,
    inner: Mutex<RecoveryInner>,
}

impl RecoveryOrchestrator {
    pub fn new(default_policy: RecoveryPolicy) -> Arc<Self> {
        Arc::new(Self {
            default_policy,
            inner: Mutex::new(RecoveryInner {
                tasks: HashMap::new(),
                queue: BinaryHeap::new(),
                history: Vec::new(),
                health_checks: HashMap::new(),
            }),
        })
    }

    /// Schedules recovery for `service_name` if it isn't already
    /// scheduled, and spawns the background loop that drives retries
    /// until the task resolves or exhausts its attempts.
    pub async fn schedule_recovery(
        self: &Arc<Self>,
        service_name: impl Into<String>,
        strategy: RecoveryStrategy,
        policy: Option<RecoveryPolicy>,
        health_check: Option<HealthCheck>,
    ) {
        let service_name = service_name.into();
        let policy = policy.unwrap_or_else(|| self.default_policy.clone());
        let next_attempt_at = next_attempt_time(strategy, &policy, 0);

        {
            let mut inner = self.inner.lock().await;
            if inner.tasks.contains_key(&service_name) {
                return;
            }
            inner.tasks.insert(
                service_name.clone(),
                RecoveryTask {
                    service_name: service_name.clone(),
                    strategy,
                    policy,
                    attempt_count: 0,
                    state: RecoveryState::Scheduled,
                    next_attempt_at,
                },
            );
            if let Some(check) = health_check {
                inner.health_checks.insert(service_name.clone(), check);
            }
            inner.queue.push(ScheduledAttempt { next_attempt_at, service_name: service_name.clone() });
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.drive(service_name).await;
        });
    }

    async fn drive(self: Arc<Self>, service_name: String) {
        loop {
            let wait = {
                let inner = self.inner.lock().await;
                let Some(task) = inner.tasks.get(&service_name) else { return };
                if task.state != RecoveryState::Scheduled {
                    return;
                }
                let now = Utc::now();
                if task.next_attempt_at > now {
                    (task.next_attempt_at - now).to_std().unwrap_or(Duration::from_millis(0))
                } else {
                    Duration::from_millis(0)
                }
            };

            sleep(wait).await;

            let result = self.execute_recovery(&service_name).await;
            match result {
                Ok(result) if result.success || result.state == RecoveryState::Failed => return,
                Ok(_) => continue,
                Err(e) => {
                    error!("recovery execution error for {service_name}: {e}");
                    return;
                }
            }
        }
    }

    pub fn cancel_recovery(self: &Arc<Self>, service_name: &str) -> bool {
        let inner = self.inner.try_lock();
        match inner {
            Ok(mut inner) => {
                if let Some(task) = inner.tasks.get_mut(service_name) {
                    task.state = RecoveryState::Cancelled;
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        }
    }

    /// Runs one recovery attempt immediately, via the registered
    /// health check (a successful check ends recovery; otherwise the
    /// task reschedules or gives up once attempts are exhausted).
    pub async fn execute_recovery(&self, service_name: &str) -> BusResult<RecoveryResult> {
        let start = std::time::Instant::now();

        let (strategy, mut attempt_count, max_attempts, health_check) = {
            let inner = self.inner.lock().await;
            let task = inner
                .tasks
                .get(service_name)
                .ok_or_else(|| BusError::RecoveryTerminal(format!("no active recovery task for {service_name}")))?;
            (task.strategy, task.attempt_count, task.policy.max_retry_attempts, inner.health_checks.get(service_name).cloned())
        };

        attempt_count += 1;

        let (success, error_message) = match &health_check {
            Some(check) => {
                let passed = check();
                (passed, if passed { None } else { Some("health check failed".to_string()) })
            }
            None => (true, None),
        };

        let elapsed = start.elapsed();
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(service_name) else {
            return Err(BusError::RecoveryTerminal(format!("recovery task for {service_name} vanished mid-attempt")));
        };

        task.attempt_count = attempt_count;
        let final_state = if success {
            RecoveryState::Succeeded
        } else if attempt_count >= max_attempts {
            RecoveryState::Failed
        } else {
            task.next_attempt_at = next_attempt_time(strategy, &task.policy, attempt_count);
            inner.queue.push(ScheduledAttempt { next_attempt_at: task.next_attempt_at, service_name: service_name.to_string() });
            RecoveryState::Scheduled
        };
        task.state = final_state;

        if matches!(final_state, RecoveryState::Succeeded | RecoveryState::Failed) {
            inner.tasks.remove(service_name);
            if final_state == RecoveryState::Failed {
                warn!("recovery for {service_name} exhausted after {attempt_count} attempts");
            }
        }

        let result = RecoveryResult {
            service_name: service_name.to_string(),
            success,
            attempt_number: attempt_count,
            total_attempts: max_attempts,
            elapsed,
            state: final_state,
            error_message,
            timestamp: Utc::now(),
        };
        inner.history.push(result.clone());
        Ok(result)
    }

    pub async fn history(&self) -> Vec<RecoveryResult> {
        self.inner.lock().await.history.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }
}

fn next_attempt_time(strategy: RecoveryStrategy, policy: &RecoveryPolicy, attempt_count: u32) -> DateTime<Utc> {
    let now = Utc::now();
    let delay_ms = match strategy {
        RecoveryStrategy::Immediate => return now,
        RecoveryStrategy::Manual => return now,
        RecoveryStrategy::LinearBackoff => policy.initial_delay_ms * attempt_count.max(1) as u64,
        RecoveryStrategy::ExponentialBackoff => {
            let exponent = attempt_count.saturating_sub(1);
            (policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent as i32)) as u64
        }
    };

    now + chrono::Duration::milliseconds(delay_ms.min(policy.max_delay_ms) as i64)
}

use serde::Serialize;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[test]
    fn policy_rejects_zero_retries() {
        let policy = RecoveryPolicy { max_retry_attempts: 0, ..RecoveryPolicy::default() };
        assert!(policy.validate().is_err());
    }

    #[tokio::test]
    async fn immediate_strategy_succeeds_on_first_attempt() {
        let orchestrator = RecoveryOrchestrator::new(RecoveryPolicy::default());
        orchestrator
            .schedule_recovery("svc-a", RecoveryStrategy::Immediate, None, Some(Arc::new(|| true)))
            .await;

        let result = orchestrator.execute_recovery("svc-a").await.unwrap();
        assert!(result.success);
        assert_eq!(result.state, RecoveryState::Succeeded);
    }

    #[tokio::test]
    async fn exhausted_attempts_transition_to_failed() {
        let policy = RecoveryPolicy { max_retry_attempts: 2, initial_delay_ms: 0, max_delay_ms: 0, backoff_multiplier: 1.0 };
        let orchestrator = RecoveryOrchestrator::new(policy.clone());
        orchestrator
            .schedule_recovery("svc-b", RecoveryStrategy::Immediate, Some(policy), Some(Arc::new(|| false)))
            .await;

        orchestrator.execute_recovery("svc-b").await.unwrap();
        let second = orchestrator.execute_recovery("svc-b").await.unwrap();
        assert_eq!(second.state, RecoveryState::Failed);
        assert_eq!(orchestrator.active_count().await, 0);
    }

    #[test]
    fn exponential_backoff_grows_with_attempt_count() {
        let policy = RecoveryPolicy { initial_delay_ms: 1000, backoff_multiplier: 2.0, max_delay_ms: 60_000, max_retry_attempts: 5 };
        let first = next_attempt_time(RecoveryStrategy::ExponentialBackoff, &policy, 1) - Utc::now();
        let second = next_attempt_time(RecoveryStrategy::ExponentialBackoff, &policy, 2) - Utc::now();
        assert!(second > first);
    }

    #[allow(dead_code)]
    fn counting_check(counter: Arc<AtomicU32>) -> HealthCheck {
        Arc::new(move || counter.fetch_add(1, AtomicOrdering::SeqCst) < 1)
    }
}

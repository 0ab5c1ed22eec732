//! The Agent Bus front door (spec.md §4.1): composes the registry,
//! router, processor, impact scorer, deliberation lane, and security
//! scanner into the single entry point callers actually talk to.
//!
//! Grounded on `agent_bus.py`'s `EnhancedAgentBus`: a state machine
//! (`Unstarted -> Starting -> Running -> Stopping -> Stopped`) around
//! `start`/`stop`, a `send_message` pipeline that never raises across
//! its public boundary, and `get_metrics`/`get_metrics_async` returning
//! a flat counter snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::audit::AuditClient;
use crate::config::BusConfiguration;
use crate::deliberation::{ConsensusRule, DeliberationLayer, DeliberationOutcome};
use crate::impact::{AdaptiveRouter, ImpactScorer};
use crate::maci::{MACIEnforcer, MACIRole, MACIRoleRegistry, MACIValidationStrategy};
use crate::metrics::{BusMetrics, MetricsSnapshot};
use crate::model::tenant::{check_tenant_consistency, DefaultTenantValidator, TenantValidator};
use crate::opa::OpaClient;
use crate::policy_client::PolicyClient;
use crate::processing::{
    CircuitBreakerProcessingStrategy, FallbackCompositeProcessingStrategy, MaciGuardedProcessingStrategy,
    ProcessingStrategy, StandardProcessingStrategy,
};
use crate::processor::{MessageProcessor, MessageProcessorConfig};
use crate::recovery::{RecoveryOrchestrator, RecoveryPolicy};
use crate::registry::{AgentRecord, AgentRegistry, CapabilityRouter, InMemoryAgentRegistry, MessageRouter};
use crate::security::{RuntimeSecurityScanner, SecurityEventType};
use crate::transport::MessageTransport;
use crate::validation::{
    CompositeValidationStrategy, DynamicPolicyValidationStrategy, OpaValidationStrategy, StaticHashValidationStrategy,
    ValidationStrategy,
};
use crate::{AgentMessage, BusError, BusResult, MessageStatus, ValidationResult, CONSTITUTIONAL_HASH};

const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DELIBERATION_CONSENSUS_THRESHOLD: f32 = 0.66;
const DELIBERATION_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Maps the first blocking security event to a short machine-readable
/// tag for `ValidationResult::metadata["rejection_reason"]` (spec.md §8
/// scenario 4).
fn rejection_reason(events: &[crate::security::SecurityEvent]) -> String {
    events
        .iter()
        .find_map(|event| match event.event_type {
            SecurityEventType::PromptInjectionAttempt => Some("prompt_injection".to_string()),
            SecurityEventType::TenantViolation => Some("tenant_violation".to_string()),
            SecurityEventType::ConstitutionalHashMismatch => Some("constitutional_hash_mismatch".to_string()),
            SecurityEventType::RateLimitExceeded => Some("rate_limit_exceeded".to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "blocked".to_string())
}

fn build_validation_chain(config: &BusConfiguration) -> Box<dyn ValidationStrategy> {
    let mut composite = CompositeValidationStrategy::new();
    composite.add_strategy(Box::new(StaticHashValidationStrategy::new(true)));

    if config.use_dynamic_policy {
        let policy_client = PolicyClient::new(config.policy_registry_url.clone()).with_fail_closed(config.policy_fail_closed);
        composite.add_strategy(Box::new(DynamicPolicyValidationStrategy::new(policy_client)));
    }

    if config.opa_enabled {
        let opa_client = OpaClient::new(config.opa_endpoint.clone()).with_fail_closed(config.policy_fail_closed);
        composite.add_strategy(Box::new(OpaValidationStrategy::new(opa_client)));
    }

    Box::new(composite)
}

/// Assembles the processing-strategy chain per spec.md §4.3's
/// composite/fallback shape (circuit-breaker-guarded first, a plain
/// in-process fallback second), then wraps the whole thing in the MACI
/// guard when role separation is enabled. Returns the shared role
/// registry too, so the bus's own `register_agent`/`unregister_agent`
/// can keep it in sync with the strategy's enforcer (maci.rs).
fn build_processing_strategy(config: &BusConfiguration) -> (Box<dyn ProcessingStrategy>, Option<Arc<MACIRoleRegistry>>) {
    let circuit_wrapped = CircuitBreakerProcessingStrategy::new(build_validation_chain(config));
    let standard = StandardProcessingStrategy::new(build_validation_chain(config));
    let mut strategy: Box<dyn ProcessingStrategy> =
        Box::new(FallbackCompositeProcessingStrategy::new(vec![Box::new(circuit_wrapped), Box::new(standard)]));

    let maci_registry = if config.enable_maci {
        let registry = Arc::new(MACIRoleRegistry::new());
        let enforcer = MACIEnforcer::new(Arc::clone(&registry), config.maci_strict_mode);
        strategy = Box::new(MaciGuardedProcessingStrategy::new(strategy, MACIValidationStrategy::new(enforcer)));
        Some(registry)
    } else {
        None
    };

    (strategy, maci_registry)
}

/// Composition root wiring every governance layer into one
/// `send_message`/`receive_message` surface (spec.md §4.1). Construct
/// with [`EnhancedAgentBus::new`] for an in-memory, in-process
/// deployment, or [`EnhancedAgentBus::with_registry`] to plug in a
/// distributed registry, then optionally attach an external transport
/// with [`EnhancedAgentBus::with_transport`].
pub struct EnhancedAgentBus {
    config: BusConfiguration,
    processor: MessageProcessor,
    registry: Arc<dyn AgentRegistry>,
    router: Arc<dyn MessageRouter>,
    maci_registry: Option<Arc<MACIRoleRegistry>>,
    transport: Option<Box<dyn MessageTransport>>,
    deliberation: DeliberationLayer,
    impact_scorer: ImpactScorer,
    adaptive_router: AdaptiveRouter,
    security: RuntimeSecurityScanner,
    metrics: BusMetrics,
    recovery: Arc<RecoveryOrchestrator>,
    policy_client: Option<PolicyClient>,
    audit: Option<AuditClient>,
    queue_tx: mpsc::Sender<AgentMessage>,
    queue_rx: AsyncMutex<mpsc::Receiver<AgentMessage>>,
    queue_capacity: usize,
    state: SyncMutex<BusState>,
    started_at: SyncMutex<Option<DateTime<Utc>>>,
}

impl EnhancedAgentBus {
    /// Builds a bus over an in-memory agent registry (spec.md §4.1's
    /// default, single-instance deployment).
    pub fn new(config: BusConfiguration) -> Self {
        Self::from_parts(config, Arc::new(InMemoryAgentRegistry::new()))
    }

    /// Builds a bus over a caller-supplied registry, e.g. a
    /// `DistributedRegistry` backed by a real Redis client (spec.md §6
    /// "any transport/store satisfying an interface").
    pub fn with_registry(config: BusConfiguration, registry: Arc<dyn AgentRegistry>) -> Self {
        Self::from_parts(config, registry)
    }

    /// Attaches an external transport (e.g. a Kafka adapter), preferred
    /// over the bus's own in-process queue once present (spec.md §6).
    pub fn with_transport(mut self, transport: Box<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn from_parts(config: BusConfiguration, registry: Arc<dyn AgentRegistry>) -> Self {
        let (strategy, maci_registry) = build_processing_strategy(&config);
        let processor = MessageProcessor::new(
            strategy,
            MessageProcessorConfig {
                dynamic_policy_enabled: config.use_dynamic_policy,
                opa_enabled: config.opa_enabled,
                native_backend_enabled: true,
                metering_enabled: config.enable_metering,
                ..MessageProcessorConfig::default()
            },
        );

        let audit = if config.enable_metering {
            Some(AuditClient::new(config.audit_service_url.clone()))
        } else {
            None
        };
        let policy_client = if config.use_dynamic_policy {
            Some(PolicyClient::new(config.policy_registry_url.clone()).with_fail_closed(config.policy_fail_closed))
        } else {
            None
        };

        let (queue_tx, queue_rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);

        Self {
            impact_scorer: ImpactScorer::new(None, None),
            adaptive_router: AdaptiveRouter::new(config.impact_threshold),
            deliberation: DeliberationLayer::new(DELIBERATION_CONSENSUS_THRESHOLD, DELIBERATION_TIMEOUT_SECONDS, audit.clone()),
            security: RuntimeSecurityScanner::default(),
            metrics: BusMetrics::new(),
            recovery: RecoveryOrchestrator::new(RecoveryPolicy::default()),
            registry,
            router: Arc::new(CapabilityRouter),
            maci_registry,
            transport: None,
            policy_client,
            audit,
            processor,
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            state: SyncMutex::new(BusState::Unstarted),
            started_at: SyncMutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &BusConfiguration {
        &self.config
    }

    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    pub fn deliberation(&self) -> &DeliberationLayer {
        &self.deliberation
    }

    /// The shared MACI role registry, when role separation is enabled
    /// (spec.md §4.4). Exposed so callers can record which agent
    /// produced which output (`record_output`) ahead of a
    /// `ConstitutionalValidation` message that targets it.
    pub fn maci_registry(&self) -> Option<&Arc<MACIRoleRegistry>> {
        self.maci_registry.as_ref()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), BusState::Running)
    }

    /// Brings the bus up: starts the attached transport (if any) and
    /// checks the policy registry for a rotated constitutional hash, so
    /// an operator notices drift instead of silently running stale
    /// (spec.md §6, §9 "no mutable globals" - the hash itself can't be
    /// hot-swapped, only surfaced).
    pub async fn start(&self) -> BusResult<()> {
        {
            let mut state = self.state.lock();
            if matches!(*state, BusState::Running | BusState::Starting) {
                return Ok(());
            }
            *state = BusState::Starting;
        }

        if let Some(policy_client) = &self.policy_client {
            if let Some(rotated) = policy_client.get_current_public_key().await {
                if rotated != self.config.constitutional_hash {
                    tracing::warn!(
                        current = %crate::redact::truncated_hash(&self.config.constitutional_hash),
                        rotated = %crate::redact::truncated_hash(&rotated),
                        "policy registry reports a rotated constitutional hash; restart with the updated value to adopt it"
                    );
                }
            }
        }

        if let Some(transport) = &self.transport {
            transport.start().await?;
        }

        *self.started_at.lock() = Some(Utc::now());
        *self.state.lock() = BusState::Running;
        Ok(())
    }

    pub async fn stop(&self) -> BusResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                BusState::Unstarted | BusState::Stopped => return Ok(()),
                _ => *state = BusState::Stopping,
            }
        }

        if let Some(transport) = &self.transport {
            transport.stop().await?;
        }

        *self.state.lock() = BusState::Stopped;
        Ok(())
    }

    /// Registers an agent with the bus's registry and, when MACI is
    /// enabled, with the shared role registry behind the processor's
    /// enforcer (spec.md §3, §4.4).
    pub async fn register_agent(
        &self,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: HashMap<String, Value>,
        tenant_id: Option<String>,
        maci_role: Option<MACIRole>,
    ) -> BusResult<bool> {
        let agent_id = agent_id.into();
        let mut record = AgentRecord::new(agent_id.clone(), agent_type.into());
        record.capabilities = capabilities;
        record.tenant_id = match tenant_id {
            Some(raw) => DefaultTenantValidator.normalize_and_validate(&raw)?,
            None => None,
        };
        record.maci_role = maci_role.map(|role| format!("{role:?}"));

        let registered = self.registry.register(record).await?;
        if registered {
            if let (Some(role_registry), Some(role)) = (&self.maci_registry, maci_role) {
                role_registry.register_agent(agent_id, role, HashMap::new()).await;
            }
        }
        Ok(registered)
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> BusResult<bool> {
        let removed = self.registry.unregister(agent_id).await?;
        if removed {
            if let Some(role_registry) = &self.maci_registry {
                role_registry.unregister_agent(agent_id).await;
            }
        }
        Ok(removed)
    }

    /// Runs `message` through the full send pipeline (spec.md §4.1
    /// step-by-step: hash check, tenant validation and consistency,
    /// security scan, impact scoring and dual-path routing, processor
    /// validation, delivery). Never raises; every outcome, including an
    /// internal fault, comes back as a `ValidationResult`.
    pub async fn send_message(&self, message: AgentMessage) -> ValidationResult {
        self.metrics.record_attempt();

        // A stopped bus still counts the attempt and runs the full
        // pipeline transport-less (spec.md §4.1 step 1, §4.11):
        // delivery just falls back to the in-process queue below since
        // there's no running transport consumer to hand it to.
        match self.try_send_message(message).await {
            Ok(result) => result,
            Err(e) => {
                self.metrics.record_send_failure();
                Self::degraded_denied(e.redacted_message())
            }
        }
    }

    fn degraded_denied(reason: impl Into<String>) -> ValidationResult {
        let mut result = ValidationResult::denied(reason);
        result.metadata.insert("governance_mode".to_string(), "DEGRADED".to_string());
        result
    }

    async fn try_send_message(&self, mut message: AgentMessage) -> BusResult<ValidationResult> {
        let hash_matches: bool = message.constitutional_hash.as_bytes().ct_eq(CONSTITUTIONAL_HASH.as_bytes()).into();
        if !hash_matches {
            message.status = MessageStatus::Failed;
            self.metrics.record_send_failure();
            return Ok(ValidationResult::denied(format!(
                "constitutional hash mismatch (expected prefix {})",
                crate::redact::truncated_hash(CONSTITUTIONAL_HASH)
            )));
        }

        if let Some(raw_tenant) = message.tenant_id.clone() {
            message.tenant_id = DefaultTenantValidator.normalize_and_validate(&raw_tenant)?;
        }

        let sender_tenant = self.registry.get(&message.from_agent).await?.and_then(|r| r.tenant_id);
        let recipient_tenant = if message.to_agent.is_empty() {
            None
        } else {
            self.registry.get(&message.to_agent).await?.and_then(|r| r.tenant_id)
        };
        check_tenant_consistency(sender_tenant.as_deref(), recipient_tenant.as_deref(), message.tenant_id.as_deref())?;

        let content_value = serde_json::to_value(&message.content).unwrap_or(Value::Null);
        let scan = self
            .security
            .scan(&content_value, message.tenant_id.as_deref(), Some(&message.from_agent), Some(&message.constitutional_hash))
            .await;
        if scan.blocked {
            message.status = MessageStatus::Failed;
            self.metrics.record_send_failure();
            let mut result = ValidationResult::denied(scan.block_reason.unwrap_or_else(|| "blocked by security scanner".to_string()));
            result.metadata.insert("security_events".to_string(), scan.events.len().to_string());
            result.metadata.insert("rejection_reason".to_string(), rejection_reason(&scan.events));
            return Ok(result);
        }

        let impact_score = self.impact_scorer.calculate_impact_score(&message);
        message.impact_score = Some(impact_score);
        let routing_decision = self.adaptive_router.route(&message);

        if routing_decision.requires_deliberation {
            message.status = MessageStatus::PendingDeliberation;
            let outcome = self
                .deliberation
                .process_message(message, false, true, ConsensusRule::SuperMajority)
                .await;

            let mut result = ValidationResult::review("routed to deliberation lane");
            result.metadata.insert("impact_score".to_string(), format!("{impact_score:.3}"));
            if let DeliberationOutcome::Enqueued { task_id } = outcome {
                result.metadata.insert("deliberation_task_id".to_string(), task_id);
            }
            return Ok(result);
        }

        let mut result = self.processor.process(&mut message).await;
        result.metadata.insert("impact_score".to_string(), format!("{impact_score:.3}"));

        if let Some(audit) = &self.audit {
            let _ = audit.log_decision(&message, &result).await;
        }

        if !result.is_valid {
            self.metrics.record_send_failure();
            return Ok(result);
        }

        if self.route_and_deliver(&message).await? {
            message.status = MessageStatus::Delivered;
            self.metrics.record_delivered();
        } else {
            self.metrics.record_dropped();
        }

        Ok(result)
    }

    async fn route_and_deliver(&self, message: &AgentMessage) -> BusResult<bool> {
        if let Some(transport) = &self.transport {
            return Ok(transport.send_message(message.clone()).await);
        }

        let target = self.router.route(message, self.registry.as_ref()).await?;
        match target {
            Some(_) => {
                self.queue_tx
                    .send(message.clone())
                    .await
                    .map_err(|e| BusError::Transport(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fans `message` out to every agent `MessageRouter::broadcast`
    /// resolves, excluding the sender (spec.md §4.1).
    pub async fn broadcast_message(&self, message: AgentMessage) -> BusResult<Vec<String>> {
        let targets = self.router.broadcast(&message, self.registry.as_ref(), &[]).await?;

        for target in &targets {
            let mut copy = message.clone();
            copy.to_agent = target.clone();

            let delivered = if let Some(transport) = &self.transport {
                transport.send_message(copy).await
            } else {
                self.queue_tx.send(copy).await.is_ok()
            };

            if delivered {
                self.metrics.record_delivered();
            } else {
                self.metrics.record_dropped();
            }
        }

        Ok(targets)
    }

    /// Dequeues the next delivered message, waiting up to `timeout`
    /// (spec.md §4.1). Returns `None` on timeout or an empty, closed
    /// queue; never raises.
    pub async fn receive_message(&self, timeout: Duration) -> Option<AgentMessage> {
        let mut rx = self.queue_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => {
                self.metrics.record_received();
                Some(message)
            }
            _ => None,
        }
    }

    fn queue_len(&self) -> usize {
        self.queue_capacity.saturating_sub(self.queue_tx.capacity())
    }

    /// Everything computable without an awaited health check (spec.md
    /// §4.1's `GetMetrics`).
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let agents = self.registry.list_agents().await.map(|v| v.len()).unwrap_or(0);
        MetricsSnapshot::new(
            &self.metrics,
            *self.started_at.lock(),
            agents,
            self.queue_len(),
            self.is_running(),
            self.config.enable_metering,
            format!("{:?}", self.processor.breaker_state()),
            None,
            self.processor.metrics(),
        )
    }

    /// `get_metrics` plus a live policy-registry health check (spec.md
    /// §4.1's `GetMetricsAsync`).
    pub async fn get_metrics_async(&self) -> MetricsSnapshot {
        let mut snapshot = self.get_metrics().await;
        if let Some(policy_client) = &self.policy_client {
            snapshot.policy_registry_status = Some(policy_client.health_check().await.to_string());
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::MessagePriority;

    fn bus() -> EnhancedAgentBus {
        EnhancedAgentBus::new(BusConfiguration::for_testing())
    }

    #[tokio::test]
    async fn stopped_bus_denies_send() {
        let bus = bus();
        let result = bus.send_message(AgentMessage::new()).await;
        assert!(!result.is_valid);
        assert_eq!(result.metadata.get("governance_mode").map(String::as_str), Some("DEGRADED"));
    }

    #[tokio::test]
    async fn register_and_unregister_agent_round_trips() {
        let bus = bus();
        assert!(bus.register_agent("a1", "worker", HashMap::new(), None, None).await.unwrap());
        assert!(!bus.register_agent("a1", "worker", HashMap::new(), None, None).await.unwrap());
        assert!(bus.unregister_agent("a1").await.unwrap());
        assert!(!bus.unregister_agent("a1").await.unwrap());
    }

    #[tokio::test]
    async fn send_message_with_wrong_hash_is_denied() {
        let bus = bus();
        bus.start().await.unwrap();
        let mut message = AgentMessage::new();
        message.constitutional_hash = "deadbeef".to_string();
        let result = bus.send_message(message).await;
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn send_message_blocks_cross_tenant_delivery() {
        let bus = bus();
        bus.start().await.unwrap();
        bus.register_agent("a1", "worker", HashMap::new(), Some("acme".to_string()), None).await.unwrap();
        bus.register_agent("a2", "worker", HashMap::new(), Some("globex".to_string()), None).await.unwrap();

        let mut message = AgentMessage::new();
        message.from_agent = "a1".to_string();
        message.to_agent = "a2".to_string();
        message.tenant_id = Some("acme".to_string());

        let result = bus.send_message(message).await;
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn send_message_delivers_and_is_received() {
        let bus = bus();
        bus.start().await.unwrap();
        bus.register_agent("a1", "worker", HashMap::new(), None, None).await.unwrap();
        bus.register_agent("a2", "worker", HashMap::new(), None, None).await.unwrap();

        let mut message = AgentMessage::new();
        message.from_agent = "a1".to_string();
        message.to_agent = "a2".to_string();
        message.priority = MessagePriority::Normal;

        let result = bus.send_message(message).await;
        assert!(result.is_valid);

        let received = bus.receive_message(Duration::from_millis(200)).await;
        assert!(received.is_some());
        assert_eq!(received.unwrap().to_agent, "a2");

        let snapshot = bus.get_metrics().await;
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.messages_received, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_other_agent() {
        let bus = bus();
        bus.start().await.unwrap();
        bus.register_agent("a1", "worker", HashMap::new(), None, None).await.unwrap();
        bus.register_agent("a2", "worker", HashMap::new(), None, None).await.unwrap();
        bus.register_agent("a3", "worker", HashMap::new(), None, None).await.unwrap();

        let mut message = AgentMessage::new();
        message.from_agent = "a1".to_string();

        let targets = bus.broadcast_message(message).await.unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&"a2".to_string()));
        assert!(targets.contains(&"a3".to_string()));
    }

    #[tokio::test]
    async fn receive_times_out_on_empty_queue() {
        let bus = bus();
        bus.start().await.unwrap();
        let received = bus.receive_message(Duration::from_millis(20)).await;
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_blocks_further_sends() {
        let bus = bus();
        bus.start().await.unwrap();
        bus.stop().await.unwrap();
        bus.stop().await.unwrap();
        assert!(!bus.is_running());

        let result = bus.send_message(AgentMessage::new()).await;
        assert!(!result.is_valid);
    }
}

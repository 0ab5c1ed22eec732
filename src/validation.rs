//! Validation strategies (spec.md §4.3's validation-layer sibling to
//! the processing strategies): static-hash, dynamic-policy,
//! external-policy-engine (OPA), native-backend, and an AND-combining
//! composite.

use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::opa::OpaClient;
use crate::policy_client::PolicyClient;
use crate::{AgentMessage, ValidationResult, CONSTITUTIONAL_HASH};

#[async_trait]
pub trait ValidationStrategy: Send + Sync {
    async fn validate(&self, message: &AgentMessage) -> ValidationResult;
    fn name(&self) -> &'static str;
}

/// Checks message shape and the constitutional hash in constant time
/// (spec.md §4.2 step 2).
pub struct StaticHashValidationStrategy {
    strict: bool,
}

impl StaticHashValidationStrategy {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

#[async_trait]
impl ValidationStrategy for StaticHashValidationStrategy {
    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        let mut result = ValidationResult::new();

        if message.message_id.is_empty() {
            result.add_error("Message ID is required");
            return result;
        }

        if self.strict {
            let matches: bool = message
                .constitutional_hash
                .as_bytes()
                .ct_eq(CONSTITUTIONAL_HASH.as_bytes())
                .into();
            if !matches {
                result.add_error(format!(
                    "Constitutional hash mismatch: expected {CONSTITUTIONAL_HASH}"
                ));
            }
        }

        result
    }

    fn name(&self) -> &'static str {
        "static_hash"
    }
}

/// Delegates to a hot-reloadable policy server (spec.md §6).
pub struct DynamicPolicyValidationStrategy {
    policy_client: PolicyClient,
}

impl DynamicPolicyValidationStrategy {
    pub fn new(policy_client: PolicyClient) -> Self {
        Self { policy_client }
    }
}

#[async_trait]
impl ValidationStrategy for DynamicPolicyValidationStrategy {
    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        match self.policy_client.validate_message_signature(message).await {
            Ok(result) => result,
            Err(e) => {
                error!("dynamic policy validation error: {e}");
                ValidationResult::denied(format!("Dynamic validation error: {e}"))
            }
        }
    }

    fn name(&self) -> &'static str {
        "dynamic_policy"
    }
}

/// Delegates to the external policy engine (spec.md §6).
pub struct OpaValidationStrategy {
    opa_client: OpaClient,
}

impl OpaValidationStrategy {
    pub fn new(opa_client: OpaClient) -> Self {
        Self { opa_client }
    }
}

#[async_trait]
impl ValidationStrategy for OpaValidationStrategy {
    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        match self.opa_client.validate_constitutional(message).await {
            Ok(result) => result,
            Err(e) => {
                error!("OPA validation execution error: {e}");
                ValidationResult::denied(format!("OPA validation error: {e}"))
            }
        }
    }

    fn name(&self) -> &'static str {
        "opa"
    }
}

/// Fail-closed wrapper around the in-process fast path, guarded by a
/// circuit breaker so repeated internal failures don't keep tripping
/// every message through the same broken check (spec.md §4.3).
pub struct NativeBackendValidationStrategy<F>
where
    F: Fn(&AgentMessage) -> ValidationResult + Send + Sync,
{
    check: F,
    breaker: CircuitBreaker,
}

impl<F> NativeBackendValidationStrategy<F>
where
    F: Fn(&AgentMessage) -> ValidationResult + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self { check, breaker: CircuitBreaker::default() }
    }
}

#[async_trait]
impl<F> ValidationStrategy for NativeBackendValidationStrategy<F>
where
    F: Fn(&AgentMessage) -> ValidationResult + Send + Sync,
{
    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        if !self.breaker.is_available() {
            warn!("native backend validation circuit breaker is open");
            return ValidationResult::denied("native backend unavailable - fail closed");
        }

        // A business-rule denial is not a backend failure, so every
        // completed call counts as a breaker success.
        let result = (self.check)(message);
        self.breaker.record_success();
        result
    }

    fn name(&self) -> &'static str {
        "native_backend"
    }
}

/// Runs every configured strategy and merges their results (spec.md
/// §4.3): any denial denies, any review escalates, errors accumulate.
#[derive(Default)]
pub struct CompositeValidationStrategy {
    strategies: Vec<Box<dyn ValidationStrategy>>,
}

impl CompositeValidationStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn ValidationStrategy>) {
        self.strategies.push(strategy);
    }
}

#[async_trait]
impl ValidationStrategy for CompositeValidationStrategy {
    async fn validate(&self, message: &AgentMessage) -> ValidationResult {
        let mut aggregate = ValidationResult::new();
        for strategy in &self.strategies {
            let result = strategy.validate(message).await;
            aggregate.merge(&result);
        }
        aggregate
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_hash_strategy_denies_mismatched_hash() {
        let strategy = StaticHashValidationStrategy::new(true);
        let mut msg = AgentMessage::new();
        msg.constitutional_hash = "deadbeef".to_string();
        let result = strategy.validate(&msg).await;
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn static_hash_strategy_allows_canonical_hash() {
        let strategy = StaticHashValidationStrategy::new(true);
        let msg = AgentMessage::new();
        let result = strategy.validate(&msg).await;
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn composite_strategy_denies_if_any_member_denies() {
        let mut composite = CompositeValidationStrategy::new();
        composite.add_strategy(Box::new(StaticHashValidationStrategy::new(true)));
        composite.add_strategy(Box::new(NativeBackendValidationStrategy::new(|_| {
            ValidationResult::denied("backend says no")
        })));

        let msg = AgentMessage::new();
        let result = composite.validate(&msg).await;
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("backend says no")));
    }

    #[tokio::test]
    async fn native_backend_strategy_fails_closed_when_breaker_open() {
        let strategy = NativeBackendValidationStrategy::new(|_| ValidationResult::new());
        for _ in 0..3 {
            strategy.breaker.record_failure();
        }
        let result = strategy.validate(&AgentMessage::new()).await;
        assert!(!result.is_valid);
    }
}

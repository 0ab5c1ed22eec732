//! Processing strategies (spec.md §4.3): native-equivalent, circuit
//! breaker-guarded backend, dynamic-policy, external-policy-engine, a
//! fallback-composite, and a MACI role-separation wrapper.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::maci::MACIValidationStrategy;
use crate::model::message::MessageType;
use crate::validation::ValidationStrategy;
use crate::{AgentMessage, BusError, MessageStatus, ValidationResult};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// A handler exception fails the message (spec.md §4.3's
    /// python-equivalent strategy contract): return `Err` to do so.
    async fn handle(&self, message: &AgentMessage) -> Result<(), String>;
}

pub type HandlerRegistry = HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>;

#[async_trait]
pub trait ProcessingStrategy: Send + Sync {
    async fn process(&self, message: &mut AgentMessage, handlers: &HandlerRegistry) -> ValidationResult;
    fn name(&self) -> &'static str;

    /// Whether this strategy's backend is currently able to serve a
    /// request. A strategy that returns `false` here is skipped by
    /// `FallbackCompositeProcessingStrategy` rather than having its
    /// result treated as a validation outcome (original
    /// `processing_strategies.py:604-619`'s `if not
    /// strategy.is_available(): continue`). Most strategies have
    /// nothing that can go unavailable, so the default is `true`.
    fn is_available(&self) -> bool {
        true
    }
}

/// Runs every handler registered for `message`'s type. Stops at the
/// first failing handler and surfaces its error — a handler exception
/// fails the whole message (spec.md §4.3).
async fn run_handlers(message: &AgentMessage, handlers: &HandlerRegistry) -> Result<(), String> {
    if let Some(message_handlers) = handlers.get(&message.message_type) {
        for handler in message_handlers {
            handler.handle(message).await?;
        }
    }
    Ok(())
}

/// Validates then runs handlers, with no circuit breaker or external
/// call — the default in-process strategy (spec.md §4.3).
pub struct StandardProcessingStrategy {
    validation_strategy: Box<dyn ValidationStrategy>,
}

impl StandardProcessingStrategy {
    pub fn new(validation_strategy: Box<dyn ValidationStrategy>) -> Self {
        Self { validation_strategy }
    }
}

#[async_trait]
impl ProcessingStrategy for StandardProcessingStrategy {
    async fn process(&self, message: &mut AgentMessage, handlers: &HandlerRegistry) -> ValidationResult {
        let mut result = self.validation_strategy.validate(message).await;
        if !result.is_valid {
            message.status = MessageStatus::Failed;
            return result;
        }

        if let Err(detail) = run_handlers(message, handlers).await {
            message.status = MessageStatus::Failed;
            let error = BusError::HandlerException(detail);
            result.add_error(error.redacted_message());
            return result;
        }

        message.status = MessageStatus::Delivered;
        result
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Wraps any validation strategy with a circuit breaker so repeated
/// backend failures degrade to fail-closed instead of hammering a
/// broken dependency on every message (spec.md §4.3, §4.10's cousin at
/// the message-processing layer).
pub struct CircuitBreakerProcessingStrategy {
    validation_strategy: Box<dyn ValidationStrategy>,
    breaker: CircuitBreaker,
}

impl CircuitBreakerProcessingStrategy {
    pub fn new(validation_strategy: Box<dyn ValidationStrategy>) -> Self {
        Self { validation_strategy, breaker: CircuitBreaker::default() }
    }

    pub fn is_available(&self) -> bool {
        self.breaker.is_available()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl ProcessingStrategy for CircuitBreakerProcessingStrategy {
    async fn process(&self, message: &mut AgentMessage, handlers: &HandlerRegistry) -> ValidationResult {
        if !self.breaker.is_available() {
            message.status = MessageStatus::Failed;
            return ValidationResult::denied("backend not available");
        }

        let mut result = self.validation_strategy.validate(message).await;

        if result.is_valid {
            self.breaker.record_success();
            if let Err(detail) = run_handlers(message, handlers).await {
                message.status = MessageStatus::Failed;
                result.add_error(BusError::HandlerException(detail).redacted_message());
                return result;
            }
            message.status = MessageStatus::Delivered;
        } else {
            // A business-rule denial is not a backend failure.
            self.breaker.record_success();
            message.status = MessageStatus::Failed;
        }

        result
    }

    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn is_available(&self) -> bool {
        self.breaker.is_available()
    }
}

/// Tries each strategy in order, skipping any that is currently
/// unavailable (a system/backend fault), and returns the first
/// available strategy's result as-is — a genuine validation denial is
/// returned immediately rather than retried against a more permissive
/// strategy (original `processing_strategies.py:604-619`: fallback
/// triggers only on `not strategy.is_available()`, never on a DENY).
pub struct FallbackCompositeProcessingStrategy {
    strategies: Vec<Box<dyn ProcessingStrategy>>,
}

impl FallbackCompositeProcessingStrategy {
    pub fn new(strategies: Vec<Box<dyn ProcessingStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl ProcessingStrategy for FallbackCompositeProcessingStrategy {
    async fn process(&self, message: &mut AgentMessage, handlers: &HandlerRegistry) -> ValidationResult {
        for strategy in &self.strategies {
            if !strategy.is_available() {
                warn!("processing strategy '{}' unavailable, trying next", strategy.name());
                continue;
            }
            return strategy.process(message, handlers).await;
        }

        error!("all processing strategies unavailable");
        message.status = MessageStatus::Failed;
        ValidationResult::denied("no processing strategy available")
    }

    fn name(&self) -> &'static str {
        "fallback_composite"
    }
}

/// Wraps a processing strategy with MACI role-separation enforcement
/// (spec.md §4.4): denies before the inner strategy ever runs if the
/// sender isn't permitted to perform the mapped action.
pub struct MaciGuardedProcessingStrategy {
    inner: Box<dyn ProcessingStrategy>,
    maci: MACIValidationStrategy,
}

impl MaciGuardedProcessingStrategy {
    pub fn new(inner: Box<dyn ProcessingStrategy>, maci: MACIValidationStrategy) -> Self {
        Self { inner, maci }
    }
}

#[async_trait]
impl ProcessingStrategy for MaciGuardedProcessingStrategy {
    async fn process(&self, message: &mut AgentMessage, handlers: &HandlerRegistry) -> ValidationResult {
        if let Err(e) = self.maci.validate(message).await {
            message.status = MessageStatus::Failed;
            return ValidationResult::denied(e.redacted_message());
        }

        self.inner.process(message, handlers).await
    }

    fn name(&self) -> &'static str {
        "maci_guarded"
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::StaticHashValidationStrategy;

    struct RecordingHandler {
        called: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, _message: &AgentMessage) -> Result<(), String> {
            self.called.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: &AgentMessage) -> Result<(), String> {
            Err("handler blew up".to_string())
        }
    }

    #[tokio::test]
    async fn standard_strategy_runs_handlers_on_success() {
        let strategy = StandardProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut handlers: HandlerRegistry = HashMap::new();
        handlers.insert(
            MessageType::Command,
            vec![Arc::new(RecordingHandler { called: called.clone() })],
        );

        let mut message = AgentMessage::new();
        let result = strategy.process(&mut message, &handlers).await;
        assert!(result.is_valid);
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(message.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn standard_strategy_skips_handlers_on_failure() {
        let strategy = StandardProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));
        let mut message = AgentMessage::new();
        message.constitutional_hash = "bad".to_string();
        let handlers: HandlerRegistry = HashMap::new();
        let result = strategy.process(&mut message, &handlers).await;
        assert!(!result.is_valid);
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn standard_strategy_fails_message_on_handler_exception() {
        let strategy = StandardProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));
        let mut handlers: HandlerRegistry = HashMap::new();
        handlers.insert(MessageType::Command, vec![Arc::new(FailingHandler)]);

        let mut message = AgentMessage::new();
        let result = strategy.process(&mut message, &handlers).await;
        assert!(!result.is_valid);
        assert_eq!(message.status, MessageStatus::Failed);
        assert!(result.errors.iter().any(|e| e.contains("handler exception")));
    }

    #[tokio::test]
    async fn circuit_breaker_strategy_denies_when_open() {
        let strategy = CircuitBreakerProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));
        strategy.breaker.record_failure();
        strategy.breaker.record_failure();
        strategy.breaker.record_failure();
        assert!(!strategy.is_available());

        let mut message = AgentMessage::new();
        let handlers: HandlerRegistry = HashMap::new();
        let result = strategy.process(&mut message, &handlers).await;
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn fallback_composite_tries_next_strategy_on_failure() {
        let failing = CircuitBreakerProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));
        failing.breaker.record_failure();
        failing.breaker.record_failure();
        failing.breaker.record_failure();

        let succeeding = StandardProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));

        let composite = FallbackCompositeProcessingStrategy::new(vec![Box::new(failing), Box::new(succeeding)]);
        let mut message = AgentMessage::new();
        let handlers: HandlerRegistry = HashMap::new();
        let result = composite.process(&mut message, &handlers).await;
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn fallback_composite_does_not_retry_a_genuine_denial() {
        let denying = StandardProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));
        let permissive = StandardProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(false)));

        let composite = FallbackCompositeProcessingStrategy::new(vec![Box::new(denying), Box::new(permissive)]);
        let mut message = AgentMessage::new();
        message.constitutional_hash = "not-the-canonical-hash".to_string();
        let handlers: HandlerRegistry = HashMap::new();
        let result = composite.process(&mut message, &handlers).await;
        assert!(!result.is_valid);
    }
}

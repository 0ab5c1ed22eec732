//! Multi-tenant agent-to-agent message bus under constitutional governance.
//!
//! This crate is the core message-processing pipeline described in
//! `SPEC_FULL.md`: the bus front door, the strategy-chained processor,
//! constitutional/role-separation validation, impact scoring and dual-path
//! routing, and the deliberation queue with multi-signature and critic
//! review gates. HTTP surfaces, ML threshold tuning, report rendering,
//! bundle distribution, SIEM shipping, and transport wire formats are
//! external collaborators; this crate only specifies their contracts.

pub mod audit;
pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod deliberation;
pub mod impact;
pub mod maci;
pub mod metrics;
pub mod model;
pub mod opa;
pub mod policy_client;
pub mod processing;
pub mod processor;
pub mod recovery;
pub mod redact;
pub mod registry;
pub mod sdpc;
pub mod security;
pub mod transport;
pub mod validation;

mod error;

pub use error::{BusError, BusResult};

/// Canonical constitutional identity. Every message crossing the bus is
/// compared against this value in constant time (spec.md §6).
pub const CONSTITUTIONAL_HASH: &str = "cdd01ef066bc6cf2";

/// Length, in hex characters, of a well-formed constitutional hash.
pub const CONSTITUTIONAL_HASH_LEN: usize = 16;

pub use bus::EnhancedAgentBus;
pub use config::BusConfiguration;
pub use model::message::{
    AgentMessage, MessagePriority, MessageStatus, MessageType, RoutingContext,
};
pub use model::validation_result::{Decision, ValidationResult};

use thiserror::Error;

/// Crate-wide error taxonomy for construction and configuration failures.
///
/// Message-level outcomes never use this type; they flow through
/// `ValidationResult` so the processor and bus can honor the
/// never-raise-across-the-public-API contract.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("constitutional hash mismatch: expected {expected}, got {actual}")]
    ConstitutionalMismatch { expected: String, actual: String },

    #[error("invalid tenant id: {0}")]
    InvalidTenant(String),

    #[error("tenant inconsistency: {0}")]
    TenantInconsistency(String),

    #[error("validation denied: {0}")]
    ValidationDenied(String),

    #[error("system fault in strategy '{strategy}': {detail}")]
    SystemFault { strategy: String, detail: String },

    #[error("role separation violation: {0}")]
    RoleSeparation(String),

    #[error("handler exception: {0}")]
    HandlerException(String),

    #[error("deliberation timeout for task {0}")]
    DeliberationTimeout(String),

    #[error("guard denial: {0}")]
    GuardDenial(String),

    #[error("recovery terminal failure for service {0}")]
    RecoveryTerminal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("registry error: {0}")]
    Registry(String),
}

pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Truncates any embedded constitutional-hash value to an 8-character
    /// prefix and redacts credentials/URIs/paths, per the error-handling
    /// design's sensitive-data rule.
    pub fn redacted_message(&self) -> String {
        crate::redact::redact_error_message(&self.to_string())
    }
}

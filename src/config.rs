//! Immutable bus configuration object (spec.md §4.1, §9 "no mutable
//! globals"). Built via `with_*` methods mirroring the teacher's
//! `dataclasses.replace` builder pattern.

use crate::CONSTITUTIONAL_HASH;

/// Consolidates every tunable of the bus into one immutable value.
/// Feature flags default to the fail-closed, security-first posture
/// the teacher settled on after its 2025-12 audit finding.
#[derive(Debug, Clone)]
pub struct BusConfiguration {
    pub redis_url: String,
    pub kafka_bootstrap_servers: String,
    pub audit_service_url: String,
    pub opa_endpoint: String,
    pub policy_registry_url: String,

    pub use_dynamic_policy: bool,
    pub opa_enabled: bool,
    pub policy_fail_closed: bool,
    pub use_kafka: bool,
    pub use_redis_registry: bool,
    pub enable_metering: bool,

    pub enable_maci: bool,
    pub maci_strict_mode: bool,

    pub impact_threshold: f32,

    pub constitutional_hash: String,
}

impl Default for BusConfiguration {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            kafka_bootstrap_servers: "localhost:9092".to_string(),
            audit_service_url: "http://localhost:8001".to_string(),
            opa_endpoint: "http://localhost:8181".to_string(),
            policy_registry_url: "http://localhost:8010".to_string(),
            use_dynamic_policy: false,
            opa_enabled: false,
            policy_fail_closed: true,
            use_kafka: false,
            use_redis_registry: false,
            enable_metering: true,
            enable_maci: true,
            maci_strict_mode: true,
            impact_threshold: crate::impact::DEFAULT_IMPACT_THRESHOLD,
            constitutional_hash: CONSTITUTIONAL_HASH.to_string(),
        }
    }
}

impl BusConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads overrides from the process environment, falling back to
    /// the default for anything unset or unparseable.
    pub fn from_environment() -> Self {
        let base = Self::default();
        Self {
            redis_url: env_or("REDIS_URL", base.redis_url),
            kafka_bootstrap_servers: env_or("KAFKA_BOOTSTRAP_SERVERS", base.kafka_bootstrap_servers),
            audit_service_url: env_or("AUDIT_SERVICE_URL", base.audit_service_url),
            opa_endpoint: env_or("OPA_ENDPOINT", base.opa_endpoint),
            policy_registry_url: env_or("POLICY_REGISTRY_URL", base.policy_registry_url),
            use_dynamic_policy: env_bool("USE_DYNAMIC_POLICY", base.use_dynamic_policy),
            opa_enabled: env_bool("OPA_ENABLED", base.opa_enabled),
            policy_fail_closed: env_bool("POLICY_FAIL_CLOSED", base.policy_fail_closed),
            use_kafka: env_bool("USE_KAFKA", base.use_kafka),
            use_redis_registry: env_bool("USE_REDIS_REGISTRY", base.use_redis_registry),
            enable_metering: env_bool("ENABLE_METERING", base.enable_metering),
            enable_maci: env_bool("MACI_ENABLED", base.enable_maci),
            maci_strict_mode: env_bool("MACI_STRICT_MODE", base.maci_strict_mode),
            impact_threshold: env_f32("IMPACT_THRESHOLD", base.impact_threshold),
            constitutional_hash: base.constitutional_hash,
        }
    }

    /// Minimal configuration for fast, isolated tests: no external
    /// backends, fail-open policy so tests don't need a live OPA.
    pub fn for_testing() -> Self {
        Self {
            use_dynamic_policy: false,
            opa_enabled: false,
            policy_fail_closed: false,
            use_kafka: false,
            use_redis_registry: false,
            enable_metering: false,
            enable_maci: false,
            maci_strict_mode: false,
            ..Self::default()
        }
    }

    /// Production posture: every feature on, fail-closed policy.
    pub fn for_production() -> Self {
        Self {
            use_dynamic_policy: true,
            opa_enabled: true,
            policy_fail_closed: true,
            use_kafka: true,
            use_redis_registry: true,
            enable_metering: true,
            enable_maci: true,
            maci_strict_mode: true,
            ..Self::default()
        }
    }

    pub fn with_redis_url(self, redis_url: impl Into<String>) -> Self {
        Self { redis_url: redis_url.into(), ..self }
    }

    pub fn with_opa_endpoint(self, opa_endpoint: impl Into<String>) -> Self {
        Self { opa_endpoint: opa_endpoint.into(), ..self }
    }

    pub fn with_audit_service_url(self, audit_service_url: impl Into<String>) -> Self {
        Self { audit_service_url: audit_service_url.into(), ..self }
    }

    pub fn with_policy_registry_url(self, policy_registry_url: impl Into<String>) -> Self {
        Self { policy_registry_url: policy_registry_url.into(), ..self }
    }

    pub fn with_opa(self, opa_enabled: bool) -> Self {
        Self { opa_enabled, ..self }
    }

    pub fn with_dynamic_policy(self, use_dynamic_policy: bool) -> Self {
        Self { use_dynamic_policy, ..self }
    }

    pub fn with_impact_threshold(self, impact_threshold: f32) -> Self {
        Self { impact_threshold: impact_threshold.clamp(0.0, 1.0), ..self }
    }

    pub fn with_maci(self, enable_maci: bool, strict_mode: bool) -> Self {
        Self { enable_maci, maci_strict_mode: strict_mode, ..self }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on" | "y" | "t"),
        Err(_) => default,
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fail_closed() {
        let config = BusConfiguration::default();
        assert!(config.policy_fail_closed);
        assert!(config.enable_maci);
        assert_eq!(config.constitutional_hash, CONSTITUTIONAL_HASH);
    }

    #[test]
    fn for_testing_disables_optional_features() {
        let config = BusConfiguration::for_testing();
        assert!(!config.enable_maci);
        assert!(!config.policy_fail_closed);
    }

    #[test]
    fn for_production_enables_everything() {
        let config = BusConfiguration::for_production();
        assert!(config.use_kafka);
        assert!(config.use_redis_registry);
        assert!(config.policy_fail_closed);
    }

    #[test]
    fn builder_methods_are_immutable() {
        let base = BusConfiguration::default();
        let custom = base.clone().with_impact_threshold(0.5);
        assert_eq!(base.impact_threshold, crate::impact::DEFAULT_IMPACT_THRESHOLD);
        assert_eq!(custom.impact_threshold, 0.5);
    }
}

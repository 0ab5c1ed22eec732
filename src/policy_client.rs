//! The distinct policy-client interface (spec.md §6): fetches signed
//! policy documents from a registry service and validates messages
//! against them, independent of the constitutional OPA client in
//! `opa.rs`.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use tracing::{error, warn};

use crate::{AgentMessage, ValidationResult};

const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

/// TTL tiers matched against a policy id substring (spec.md §6,
/// `original_source/policy_client.py`): dynamic content refreshes fast,
/// constitutional/core policies can sit far longer.
const POLICY_TTL_PATTERNS: &[(&str, &str)] = &[
    ("constitutional", "stable"),
    ("governance", "stable"),
    ("core", "stable"),
    ("ab_test", "dynamic"),
    ("experiment", "dynamic"),
    ("feature_flag", "dynamic"),
];

fn tier_ttl(tier: &str) -> Duration {
    match tier {
        "dynamic" => Duration::from_secs(60),
        "standard" => Duration::from_secs(300),
        "stable" => Duration::from_secs(900),
        "immutable" => Duration::from_secs(3600),
        _ => Duration::from_secs(300),
    }
}

/// Resolves the cache TTL for a policy id by pattern match, falling
/// back to the standard tier.
pub fn optimal_cache_ttl(policy_id: &str) -> Duration {
    let lower = policy_id.to_lowercase();
    for (pattern, tier) in POLICY_TTL_PATTERNS {
        if lower.contains(pattern) {
            return tier_ttl(tier);
        }
    }
    tier_ttl("standard")
}

struct CachedPolicy {
    content: Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl CachedPolicy {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Client for the policy registry service. Bounded LRU cache keyed by
/// `{policy_id}:{client_id}` with per-pattern TTL tiers.
pub struct PolicyClient {
    registry_url: String,
    client: Client,
    fail_closed: bool,
    max_cache_size: usize,
    cache: Mutex<IndexMap<String, CachedPolicy>>,
}

impl PolicyClient {
    pub fn new(registry_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            registry_url: registry_url.into().trim_end_matches('/').to_string(),
            client,
            fail_closed: true,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            cache: Mutex::new(IndexMap::new()),
        }
    }

    pub fn with_fail_closed(mut self, fail_closed: bool) -> Self {
        self.fail_closed = fail_closed;
        self
    }

    pub fn with_max_cache_size(mut self, max_cache_size: usize) -> Self {
        self.max_cache_size = max_cache_size;
        self
    }

    /// Fetches policy content, honoring the bounded LRU cache.
    pub async fn get_policy_content(&self, policy_id: &str, client_id: Option<&str>) -> Option<Value> {
        let cache_key = format!("{policy_id}:{}", client_id.unwrap_or("default"));

        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&cache_key) {
                if !entry.is_expired() {
                    let content = entry.content.clone();
                    cache.shift_remove(&cache_key);
                    cache.insert(cache_key.clone(), CachedPolicy {
                        content: content.clone(),
                        inserted_at: Instant::now(),
                        ttl: tier_ttl_for(policy_id),
                    });
                    return Some(content);
                }
                cache.shift_remove(&cache_key);
            }
        }

        let url = format!("{}/api/v1/policies/{policy_id}/content", self.registry_url);
        let mut request = self.client.get(&url);
        if let Some(client_id) = client_id {
            request = request.query(&[("client_id", client_id)]);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!("error fetching policy {policy_id}: {e}");
                return None;
            }
        };

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            warn!("policy {policy_id} not found");
            return None;
        }
        if !response.status().is_success() {
            error!("HTTP error fetching policy {policy_id}: {}", response.status());
            return None;
        }

        let content: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                error!("data parsing error for policy {policy_id}: {e}");
                return None;
            }
        };

        let mut cache = self.cache.lock();
        while cache.len() >= self.max_cache_size {
            cache.shift_remove_index(0);
        }
        cache.insert(cache_key, CachedPolicy {
            content: content.clone(),
            inserted_at: Instant::now(),
            ttl: optimal_cache_ttl(policy_id),
        });

        Some(content)
    }

    /// Validates a message against the constitutional safety policy:
    /// length, allowed topics, and prohibited content checks.
    pub async fn validate_message_signature(&self, message: &AgentMessage) -> Result<ValidationResult, crate::BusError> {
        let policy = self.get_policy_content("constitutional_ai_safety", None).await;

        let Some(policy) = policy else {
            let mut result = ValidationResult::new();
            if self.fail_closed {
                result.add_error("Policy registry unavailable or policy not found");
            } else {
                result.add_warning("Policy registry unavailable, using basic validation");
            }
            return Ok(result);
        };

        let mut result = ValidationResult::new();

        let content_repr = format!("{:?}", message.content);
        let max_length = policy.get("max_response_length").and_then(Value::as_u64).unwrap_or(10_000) as usize;
        if content_repr.len() > max_length {
            result.add_error(format!("Message exceeds maximum length of {max_length}"));
        }

        if let Some(allowed_topics) = policy.get("allowed_topics").and_then(Value::as_array) {
            if !allowed_topics.is_empty() {
                let message_topics: Vec<String> = message
                    .content
                    .get("topics")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let allowed: Vec<&str> = allowed_topics.iter().filter_map(Value::as_str).collect();
                if !message_topics.iter().any(|t| allowed.contains(&t.as_str())) {
                    result.add_warning("Message topic not in allowed list");
                }
            }
        }

        if let Some(prohibited) = policy.get("prohibited_content").and_then(Value::as_array) {
            let message_text = content_repr.to_lowercase();
            for item in prohibited.iter().filter_map(Value::as_str) {
                if message_text.contains(&item.to_lowercase()) {
                    result.add_error(format!("Message contains prohibited content: {item}"));
                }
            }
        }

        Ok(result)
    }

    pub async fn health_check(&self) -> Value {
        let url = format!("{}/health/ready", self.registry_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => serde_json::json!({"status": "healthy"}),
            Ok(resp) => serde_json::json!({"status": "unhealthy", "code": resp.status().as_u16()}),
            Err(e) => serde_json::json!({"status": "unhealthy", "error": e.to_string()}),
        }
    }

    /// Fetches the registry's currently active constitutional hash, so
    /// the bus can pick up a rotated hash on startup or re-registration
    /// without a restart (spec.md §6).
    pub async fn get_current_public_key(&self) -> Option<String> {
        let url = format!("{}/api/v1/keys/current", self.registry_url);
        let response = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!("non-success response fetching current public key: {}", resp.status());
                return None;
            }
            Err(e) => {
                error!("error fetching current public key: {e}");
                return None;
            }
        };

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                error!("data parsing error for current public key: {e}");
                return None;
            }
        };

        body.get("constitutional_hash").and_then(Value::as_str).map(str::to_string)
    }
}

fn tier_ttl_for(policy_id: &str) -> Duration {
    optimal_cache_ttl(policy_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_pattern_matches_constitutional_as_stable() {
        assert_eq!(optimal_cache_ttl("constitutional_ai_safety"), Duration::from_secs(900));
    }

    #[test]
    fn ttl_pattern_matches_ab_test_as_dynamic() {
        assert_eq!(optimal_cache_ttl("ab_test_rollout_7"), Duration::from_secs(60));
    }

    #[test]
    fn ttl_pattern_falls_back_to_standard() {
        assert_eq!(optimal_cache_ttl("unrelated_policy"), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn validate_fails_closed_when_policy_unavailable() {
        let client = PolicyClient::new("http://127.0.0.1:1");
        let message = AgentMessage::new();
        let result = client.validate_message_signature(&message).await.unwrap();
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn validate_fails_open_when_configured() {
        let client = PolicyClient::new("http://127.0.0.1:1").with_fail_closed(false);
        let message = AgentMessage::new();
        let result = client.validate_message_signature(&message).await.unwrap();
        assert!(result.is_valid);
    }
}

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::CONSTITUTIONAL_HASH;

/// Message types for agent communication. `AuditLog` is carried forward
/// from `original_source` — the teacher's port dropped it, but MACI's
/// action map (§4.4) names it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Query,
    Response,
    Event,
    Notification,
    Heartbeat,
    GovernanceRequest,
    GovernanceResponse,
    ConstitutionalValidation,
    TaskRequest,
    TaskResponse,
    AuditLog,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// Message processing status. Transitions are enforced only by the
/// processor and bus (§3 invariants): Pending -> Processing ->
/// (Validated|Failed) -> (Delivered|PendingDeliberation|Failed|Expired).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Validated,
    Delivered,
    Failed,
    Expired,
    PendingDeliberation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingContext {
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub routing_key: String,
    pub routing_tags: Vec<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_ms: i32,
    pub constitutional_hash: String,
}

/// The agent message. Immutable on the wire except for status and
/// timestamps, which only the processor/bus mutate (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub content: HashMap<String, Value>,
    pub payload: HashMap<String, Value>,
    pub from_agent: String,
    pub to_agent: String,
    pub sender_id: String,
    pub message_type: MessageType,
    pub routing: Option<RoutingContext>,
    pub headers: HashMap<String, String>,
    pub tenant_id: Option<String>,
    pub security_context: HashMap<String, String>,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub constitutional_hash: String,
    pub constitutional_validated: bool,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: Option<String>,
    pub impact_score: Option<f32>,
    pub performance_metrics: HashMap<String, f64>,
}

impl Default for AgentMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMessage {
    pub fn new() -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: Uuid::new_v4().to_string(),
            content: HashMap::new(),
            payload: HashMap::new(),
            from_agent: String::new(),
            to_agent: String::new(),
            sender_id: String::new(),
            message_type: MessageType::Command,
            routing: None,
            headers: HashMap::new(),
            tenant_id: None,
            security_context: HashMap::new(),
            priority: MessagePriority::Normal,
            status: MessageStatus::Pending,
            constitutional_hash: CONSTITUTIONAL_HASH.to_string(),
            constitutional_validated: false,
            created_at: now.clone(),
            updated_at: now,
            expires_at: None,
            impact_score: None,
            performance_metrics: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }

    /// Stringifies `content` for prompt-injection screening and cache-key
    /// hashing (§4.2 steps 1-2). Key order is stable because `content`
    /// is serialized via `serde_json`'s deterministic map iteration over
    /// a `HashMap` is *not* guaranteed; callers that need a stable cache
    /// key should prefer `Self::content_digest`.
    pub fn content_as_text(&self) -> String {
        self.content
            .values()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Stable digest of `content` for the processor's validation-result
    /// cache key (§4.2 step 2, §8 round-trip/cache tests): sorts keys
    /// before hashing so the digest is independent of `HashMap` iteration
    /// order.
    pub fn content_digest(&self) -> String {
        use std::collections::BTreeMap;
        let sorted: BTreeMap<&String, &Value> = self.content.iter().collect();
        let canonical = serde_json::to_string(&sorted).unwrap_or_default();
        format!("{:x}", md5_like_hash(canonical.as_bytes()))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json_str: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json_str)
    }
}

/// Small non-cryptographic FNV-1a hash. The cache key only needs
/// stability and low collision rate, not cryptographic strength.
fn md5_like_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_carries_canonical_hash() {
        let msg = AgentMessage::new();
        assert_eq!(msg.constitutional_hash, CONSTITUTIONAL_HASH);
        assert_eq!(msg.status, MessageStatus::Pending);
    }

    #[test]
    fn content_digest_is_order_independent() {
        let mut a = AgentMessage::new();
        a.content.insert("action".into(), Value::String("ping".into()));
        a.content.insert("target".into(), Value::String("b".into()));

        let mut b = AgentMessage::new();
        b.content.insert("target".into(), Value::String("b".into()));
        b.content.insert("action".into(), Value::String("ping".into()));

        assert_eq!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let mut msg = AgentMessage::new();
        msg.from_agent = "agent-a".into();
        msg.to_agent = "agent-b".into();
        let json = msg.to_json().unwrap();
        let back = AgentMessage::from_json(&json).unwrap();
        assert_eq!(back.from_agent, msg.from_agent);
        assert_eq!(back.message_id, msg.message_id);
    }
}

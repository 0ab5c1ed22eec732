//! Agent registries and message routers (spec.md §3 "Agent record",
//! §4.1's direct/capability routing).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{AgentMessage, BusError, BusResult};

/// The agent record stored by every registry implementation (spec.md
/// §3). `maci_role` is a plain string here so the registry doesn't have
/// to depend on `crate::maci`; callers that enable MACI parse it back
/// into a `MACIRole` when registering with the enforcer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub tenant_id: Option<String>,
    pub maci_role: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: HashMap::new(),
            metadata: HashMap::new(),
            tenant_id: None,
            maci_role: None,
            registered_at: Utc::now(),
        }
    }
}

/// Recursively merges `incoming` into `base`: nested objects are
/// merged key by key instead of replacing the whole value, as
/// `update_metadata`'s "deep-merge" contract requires (spec.md §4.7).
/// Non-object values (and object vs. non-object mismatches) take the
/// incoming value outright.
fn deep_merge_json(base: &mut HashMap<String, Value>, incoming: HashMap<String, Value>) {
    for (key, incoming_value) in incoming {
        match base.get_mut(&key) {
            Some(Value::Object(existing_map)) => match incoming_value {
                Value::Object(incoming_map) => {
                    let mut existing: HashMap<String, Value> =
                        existing_map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    deep_merge_json(&mut existing, incoming_map.into_iter().collect());
                    *existing_map = existing.into_iter().collect();
                }
                other => {
                    base.insert(key, other);
                }
            },
            _ => {
                base.insert(key, incoming_value);
            }
        }
    }
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn register(&self, record: AgentRecord) -> BusResult<bool>;
    async fn unregister(&self, agent_id: &str) -> BusResult<bool>;
    async fn get(&self, agent_id: &str) -> BusResult<Option<AgentRecord>>;
    async fn list_agents(&self) -> BusResult<Vec<String>>;
    async fn exists(&self, agent_id: &str) -> BusResult<bool>;
    async fn update_metadata(&self, agent_id: &str, metadata: HashMap<String, Value>) -> BusResult<bool>;
    async fn clear(&self) -> BusResult<()>;
}

/// Thread-safe single-instance registry (spec.md §4.1).
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn register(&self, record: AgentRecord) -> BusResult<bool> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&record.agent_id) {
            return Ok(false);
        }
        agents.insert(record.agent_id.clone(), record);
        Ok(true)
    }

    async fn unregister(&self, agent_id: &str) -> BusResult<bool> {
        Ok(self.agents.write().await.remove(agent_id).is_some())
    }

    async fn get(&self, agent_id: &str) -> BusResult<Option<AgentRecord>> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn list_agents(&self) -> BusResult<Vec<String>> {
        Ok(self.agents.read().await.keys().cloned().collect())
    }

    async fn exists(&self, agent_id: &str) -> BusResult<bool> {
        Ok(self.agents.read().await.contains_key(agent_id))
    }

    async fn update_metadata(&self, agent_id: &str, metadata: HashMap<String, Value>) -> BusResult<bool> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(record) => {
                deep_merge_json(&mut record.metadata, metadata);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> BusResult<()> {
        self.agents.write().await.clear();
        Ok(())
    }
}

/// Adapter over whatever remote hash-backed key/value store backs a
/// distributed deployment (Redis in the teacher's port). Kept as a
/// trait rather than a hard `redis` dependency so the bus doesn't force
/// a particular client on every caller (spec.md §6 "any transport
/// satisfying an interface").
#[async_trait]
pub trait RemoteKeyValueStore: Send + Sync {
    async fn hsetnx(&self, key: &str, field: &str, value: String) -> BusResult<bool>;
    async fn hget(&self, key: &str, field: &str) -> BusResult<Option<String>>;
    async fn hdel(&self, key: &str, field: &str) -> BusResult<bool>;
    async fn hkeys(&self, key: &str) -> BusResult<Vec<String>>;
    async fn hexists(&self, key: &str, field: &str) -> BusResult<bool>;
    async fn hset(&self, key: &str, field: &str, value: String) -> BusResult<()>;
    async fn delete(&self, key: &str) -> BusResult<()>;
}

/// Distributed registry backed by a remote hash, mirroring the
/// teacher's `HSETNX`/`HGET`/`HDEL`/`HKEYS`/`HEXISTS`/`HSET` usage so it
/// can run behind a real connection pool (20 connections, 5s socket
/// timeout in the teacher's default).
pub struct DistributedRegistry<S: RemoteKeyValueStore> {
    store: S,
    key_prefix: String,
}

impl<S: RemoteKeyValueStore> DistributedRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store, key_prefix: "acgs2:registry:agents".to_string() }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

#[async_trait]
impl<S: RemoteKeyValueStore> AgentRegistry for DistributedRegistry<S> {
    async fn register(&self, record: AgentRecord) -> BusResult<bool> {
        let payload = serde_json::to_string(&record)
            .map_err(|e| BusError::Registry(format!("failed to serialize agent record: {e}")))?;
        self.store.hsetnx(&self.key_prefix, &record.agent_id, payload).await
    }

    async fn unregister(&self, agent_id: &str) -> BusResult<bool> {
        self.store.hdel(&self.key_prefix, agent_id).await
    }

    async fn get(&self, agent_id: &str) -> BusResult<Option<AgentRecord>> {
        match self.store.hget(&self.key_prefix, agent_id).await? {
            Some(raw) => {
                let record = serde_json::from_str(&raw)
                    .map_err(|e| BusError::Registry(format!("failed to deserialize agent record: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn list_agents(&self) -> BusResult<Vec<String>> {
        self.store.hkeys(&self.key_prefix).await
    }

    async fn exists(&self, agent_id: &str) -> BusResult<bool> {
        self.store.hexists(&self.key_prefix, agent_id).await
    }

    async fn update_metadata(&self, agent_id: &str, metadata: HashMap<String, Value>) -> BusResult<bool> {
        let Some(mut record) = self.get(agent_id).await? else {
            return Ok(false);
        };
        deep_merge_json(&mut record.metadata, metadata);
        let payload = serde_json::to_string(&record)
            .map_err(|e| BusError::Registry(format!("failed to serialize agent record: {e}")))?;
        self.store.hset(&self.key_prefix, agent_id, payload).await?;
        Ok(true)
    }

    async fn clear(&self) -> BusResult<()> {
        self.store.delete(&self.key_prefix).await
    }
}

fn normalize_tenant(tenant_id: Option<&str>) -> Option<String> {
    tenant_id.filter(|t| !t.is_empty()).map(str::to_string)
}

#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn route(&self, message: &AgentMessage, registry: &dyn AgentRegistry) -> BusResult<Option<String>>;
    async fn broadcast(
        &self,
        message: &AgentMessage,
        registry: &dyn AgentRegistry,
        exclude: &[String],
    ) -> BusResult<Vec<String>>;
}

/// Routes directly to `message.to_agent`, refusing to cross a tenant
/// boundary (spec.md §4.8).
pub struct DirectRouter;

#[async_trait]
impl MessageRouter for DirectRouter {
    async fn route(&self, message: &AgentMessage, registry: &dyn AgentRegistry) -> BusResult<Option<String>> {
        if message.to_agent.is_empty() {
            return Ok(None);
        }
        if !registry.exists(&message.to_agent).await? {
            return Ok(None);
        }
        let Some(record) = registry.get(&message.to_agent).await? else {
            return Ok(None);
        };

        let message_tenant = normalize_tenant(message.tenant_id.as_deref());
        let agent_tenant = normalize_tenant(record.tenant_id.as_deref());
        if message_tenant != agent_tenant {
            return Ok(None);
        }

        Ok(Some(message.to_agent.clone()))
    }

    async fn broadcast(
        &self,
        message: &AgentMessage,
        registry: &dyn AgentRegistry,
        exclude: &[String],
    ) -> BusResult<Vec<String>> {
        let all_agents = registry.list_agents().await?;
        let mut exclude_set: std::collections::HashSet<String> = exclude.iter().cloned().collect();
        if !message.from_agent.is_empty() {
            exclude_set.insert(message.from_agent.clone());
        }
        Ok(all_agents.into_iter().filter(|a| !exclude_set.contains(a)).collect())
    }
}

/// Routes to `to_agent` when present, otherwise to the first agent
/// whose capabilities satisfy `content.required_capabilities`.
pub struct CapabilityRouter;

impl CapabilityRouter {
    fn required_capabilities(message: &AgentMessage) -> Vec<String> {
        message
            .content
            .get("required_capabilities")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    fn satisfies(record: &AgentRecord, required: &[String]) -> bool {
        required.iter().all(|cap| record.capabilities.contains_key(cap))
    }
}

#[async_trait]
impl MessageRouter for CapabilityRouter {
    async fn route(&self, message: &AgentMessage, registry: &dyn AgentRegistry) -> BusResult<Option<String>> {
        if !message.to_agent.is_empty() && registry.exists(&message.to_agent).await? {
            return Ok(Some(message.to_agent.clone()));
        }

        let required = Self::required_capabilities(message);
        if required.is_empty() {
            return Ok(None);
        }

        for agent_id in registry.list_agents().await? {
            if let Some(record) = registry.get(&agent_id).await? {
                if Self::satisfies(&record, &required) {
                    return Ok(Some(agent_id));
                }
            }
        }
        Ok(None)
    }

    async fn broadcast(
        &self,
        message: &AgentMessage,
        registry: &dyn AgentRegistry,
        exclude: &[String],
    ) -> BusResult<Vec<String>> {
        let required = Self::required_capabilities(message);
        let mut exclude_set: std::collections::HashSet<String> = exclude.iter().cloned().collect();
        if !message.from_agent.is_empty() {
            exclude_set.insert(message.from_agent.clone());
        }

        let mut matching = Vec::new();
        for agent_id in registry.list_agents().await? {
            if exclude_set.contains(&agent_id) {
                continue;
            }
            if required.is_empty() {
                matching.push(agent_id);
                continue;
            }
            if let Some(record) = registry.get(&agent_id).await? {
                if Self::satisfies(&record, &required) {
                    matching.push(agent_id);
                }
            }
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_rejects_duplicate_agent_id() {
        let registry = InMemoryAgentRegistry::new();
        assert!(registry.register(AgentRecord::new("a1", "worker")).await.unwrap());
        assert!(!registry.register(AgentRecord::new("a1", "worker")).await.unwrap());
    }

    #[tokio::test]
    async fn unregister_removes_agent() {
        let registry = InMemoryAgentRegistry::new();
        registry.register(AgentRecord::new("a1", "worker")).await.unwrap();
        assert!(registry.unregister("a1").await.unwrap());
        assert!(!registry.exists("a1").await.unwrap());
    }

    #[tokio::test]
    async fn update_metadata_deep_merges_nested_objects() {
        let registry = InMemoryAgentRegistry::new();
        let mut record = AgentRecord::new("a1", "worker");
        record.metadata.insert(
            "limits".to_string(),
            serde_json::json!({"max_tokens": 100, "region": "us"}),
        );
        registry.register(record).await.unwrap();

        let mut update = HashMap::new();
        update.insert("limits".to_string(), serde_json::json!({"max_tokens": 200}));
        update.insert("status".to_string(), Value::String("active".to_string()));
        assert!(registry.update_metadata("a1", update).await.unwrap());

        let record = registry.get("a1").await.unwrap().unwrap();
        assert_eq!(record.metadata.get("limits"), Some(&serde_json::json!({"max_tokens": 200, "region": "us"})));
        assert_eq!(record.metadata.get("status"), Some(&Value::String("active".to_string())));
    }

    #[tokio::test]
    async fn direct_router_blocks_cross_tenant_delivery() {
        let registry = InMemoryAgentRegistry::new();
        let mut record = AgentRecord::new("a1", "worker");
        record.tenant_id = Some("globex".to_string());
        registry.register(record).await.unwrap();

        let mut message = AgentMessage::new();
        message.to_agent = "a1".to_string();
        message.tenant_id = Some("acme".to_string());

        let router = DirectRouter;
        assert_eq!(router.route(&message, &registry).await.unwrap(), None);
    }

    #[tokio::test]
    async fn direct_router_delivers_when_tenants_match() {
        let registry = InMemoryAgentRegistry::new();
        let mut record = AgentRecord::new("a1", "worker");
        record.tenant_id = Some("acme".to_string());
        registry.register(record).await.unwrap();

        let mut message = AgentMessage::new();
        message.to_agent = "a1".to_string();
        message.tenant_id = Some("acme".to_string());

        let router = DirectRouter;
        assert_eq!(router.route(&message, &registry).await.unwrap(), Some("a1".to_string()));
    }

    #[tokio::test]
    async fn capability_router_finds_matching_agent() {
        let registry = InMemoryAgentRegistry::new();
        let mut record = AgentRecord::new("a1", "worker");
        record.capabilities.insert("ocr".to_string(), Value::Bool(true));
        registry.register(record).await.unwrap();

        let mut message = AgentMessage::new();
        message.content.insert(
            "required_capabilities".to_string(),
            Value::Array(vec![Value::String("ocr".to_string())]),
        );

        let router = CapabilityRouter;
        assert_eq!(router.route(&message, &registry).await.unwrap(), Some("a1".to_string()));
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let registry = InMemoryAgentRegistry::new();
        registry.register(AgentRecord::new("a1", "worker")).await.unwrap();
        registry.register(AgentRecord::new("a2", "worker")).await.unwrap();

        let mut message = AgentMessage::new();
        message.from_agent = "a1".to_string();

        let router = DirectRouter;
        let targets = router.broadcast(&message, &registry, &[]).await.unwrap();
        assert_eq!(targets, vec!["a2".to_string()]);
    }
}

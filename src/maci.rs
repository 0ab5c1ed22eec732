//! MACI (role-separation) enforcement (spec.md §4.4): prevents an agent
//! from validating its own output or crossing role boundaries it has no
//! permission for — the "Gödel bypass" defense.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::model::message::MessageType;
use crate::{AgentMessage, BusError, BusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MACIRole {
    Executive,
    Legislative,
    Judicial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MACIAction {
    Propose,
    Validate,
    ExtractRules,
    Synthesize,
    Audit,
    Query,
    ManagePolicy,
    EmergencyCooldown,
}

static ROLE_PERMISSIONS: Lazy<HashMap<MACIRole, HashSet<MACIAction>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        MACIRole::Executive,
        HashSet::from([MACIAction::Propose, MACIAction::Synthesize, MACIAction::Query]),
    );
    map.insert(
        MACIRole::Legislative,
        HashSet::from([MACIAction::ExtractRules, MACIAction::Synthesize, MACIAction::Query]),
    );
    map.insert(
        MACIRole::Judicial,
        HashSet::from([
            MACIAction::Validate,
            MACIAction::Audit,
            MACIAction::Query,
            MACIAction::EmergencyCooldown,
        ]),
    );
    map
});

static VALIDATION_CONSTRAINTS: Lazy<HashMap<MACIRole, HashSet<MACIRole>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(MACIRole::Judicial, HashSet::from([MACIRole::Executive, MACIRole::Legislative]));
    map
});

#[derive(Debug, Clone)]
pub struct MACIAgentRecord {
    pub agent_id: String,
    pub role: MACIRole,
    pub outputs: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl MACIAgentRecord {
    pub fn new(agent_id: impl Into<String>, role: MACIRole) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            outputs: Vec::new(),
            registered_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn can_perform(&self, action: MACIAction) -> bool {
        ROLE_PERMISSIONS.get(&self.role).map(|set| set.contains(&action)).unwrap_or(false)
    }

    pub fn can_validate_role(&self, target_role: MACIRole) -> bool {
        VALIDATION_CONSTRAINTS.get(&self.role).map(|set| set.contains(&target_role)).unwrap_or(false)
    }

    pub fn add_output(&mut self, output_id: String) {
        if !self.outputs.contains(&output_id) {
            self.outputs.push(output_id);
        }
    }

    pub fn owns_output(&self, output_id: &str) -> bool {
        self.outputs.iter().any(|o| o == output_id)
    }
}

/// Tracks which agent is assigned which role, and which agent produced
/// which output, so cross-role and self-validation checks have
/// somewhere to look.
#[derive(Default)]
pub struct MACIRoleRegistry {
    agents: Mutex<HashMap<String, MACIAgentRecord>>,
    output_owners: Mutex<HashMap<String, String>>,
}

impl MACIRoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_agent(
        &self,
        agent_id: impl Into<String>,
        role: MACIRole,
        metadata: HashMap<String, String>,
    ) -> MACIAgentRecord {
        let agent_id = agent_id.into();
        let mut record = MACIAgentRecord::new(agent_id.clone(), role);
        record.metadata = metadata;
        self.agents.lock().await.insert(agent_id, record.clone());
        record
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Option<MACIAgentRecord> {
        let removed = self.agents.lock().await.remove(agent_id);
        if removed.is_some() {
            let mut owners = self.output_owners.lock().await;
            owners.retain(|_, owner| owner != agent_id);
        }
        removed
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<MACIAgentRecord> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    pub async fn record_output(&self, agent_id: &str, output_id: impl Into<String>) {
        let output_id = output_id.into();
        let mut agents = self.agents.lock().await;
        if let Some(record) = agents.get_mut(agent_id) {
            record.add_output(output_id.clone());
            self.output_owners.lock().await.insert(output_id, agent_id.to_string());
        }
    }

    pub async fn get_output_producer(&self, output_id: &str) -> Option<String> {
        self.output_owners.lock().await.get(output_id).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct MACIValidationResult {
    pub is_valid: bool,
    pub violation_type: Option<String>,
}

impl MACIValidationResult {
    pub fn ok() -> Self {
        Self { is_valid: true, violation_type: None }
    }

    pub fn violation(kind: impl Into<String>) -> Self {
        Self { is_valid: false, violation_type: Some(kind.into()) }
    }
}

/// Enforces role permissions and cross-role/self-validation
/// constraints. `strict_mode` determines whether an unassigned agent is
/// denied outright or passed through with a warning.
///
/// The registry is `Arc`-shared rather than owned outright so the bus's
/// own `RegisterAgent` path and the processing strategy's enforcer
/// instance can agree on the same role assignments without a cyclic
/// reference between `bus` and `processing` (spec.md §9).
pub struct MACIEnforcer {
    pub registry: Arc<MACIRoleRegistry>,
    pub strict_mode: bool,
    validation_log: Mutex<Vec<MACIValidationResult>>,
}

impl Default for MACIEnforcer {
    fn default() -> Self {
        Self::new(Arc::new(MACIRoleRegistry::new()), true)
    }
}

impl MACIEnforcer {
    pub fn new(registry: Arc<MACIRoleRegistry>, strict_mode: bool) -> Self {
        Self { registry, strict_mode, validation_log: Mutex::new(Vec::new()) }
    }

    pub async fn validation_log(&self) -> Vec<MACIValidationResult> {
        self.validation_log.lock().await.clone()
    }

    pub async fn validate_action(
        &self,
        agent_id: &str,
        action: MACIAction,
        target_output_id: Option<&str>,
        target_agent_id: Option<&str>,
    ) -> BusResult<MACIValidationResult> {
        let record = match self.registry.get_agent(agent_id).await {
            Some(record) => record,
            None => {
                let mut log = self.validation_log.lock().await;
                if self.strict_mode {
                    log.push(MACIValidationResult::violation("not_assigned"));
                    return Err(BusError::RoleSeparation(format!(
                        "agent '{agent_id}' has no assigned MACI role for action {action:?}"
                    )));
                }
                return Ok(MACIValidationResult::ok());
            }
        };

        if !record.can_perform(action) {
            self.validation_log.lock().await.push(MACIValidationResult::violation("role_violation"));
            return Err(BusError::RoleSeparation(format!(
                "agent '{agent_id}' with role {:?} may not perform {action:?}",
                record.role
            )));
        }

        if action == MACIAction::Validate {
            if let Some(target_agent_id) = target_agent_id {
                if let Some(target) = self.registry.get_agent(target_agent_id).await {
                    if !record.can_validate_role(target.role) {
                        self.validation_log.lock().await.push(MACIValidationResult::violation("cross_role"));
                        return Err(BusError::RoleSeparation(format!(
                            "agent '{agent_id}' (role {:?}) may not validate role {:?} held by '{target_agent_id}'",
                            record.role, target.role
                        )));
                    }
                } else if self.strict_mode {
                    self.validation_log
                        .lock()
                        .await
                        .push(MACIValidationResult::violation("target_not_found"));
                    return Err(BusError::RoleSeparation(format!(
                        "target agent '{target_agent_id}' has no assigned MACI role"
                    )));
                }
            }

            if let Some(output_id) = target_output_id {
                let producer_id = self.registry.get_output_producer(output_id).await;
                if producer_id.as_deref() == Some(agent_id) || record.owns_output(output_id) {
                    self.validation_log.lock().await.push(MACIValidationResult::violation("self_validation"));
                    return Err(BusError::RoleSeparation(format!(
                        "agent '{agent_id}' may not validate its own output '{output_id}'"
                    )));
                }

                if let Some(producer_id) = producer_id {
                    if let Some(producer) = self.registry.get_agent(&producer_id).await {
                        if !record.can_validate_role(producer.role) {
                            self.validation_log.lock().await.push(MACIValidationResult::violation("cross_role"));
                            return Err(BusError::RoleSeparation(format!(
                                "agent '{agent_id}' (role {:?}) may not validate output produced by role {:?}",
                                record.role, producer.role
                            )));
                        }
                    }
                }
            }
        }

        let result = MACIValidationResult::ok();
        self.validation_log.lock().await.push(result.clone());
        Ok(result)
    }
}

/// Maps inbound message types to the MACI action they represent, so the
/// processor's strategy chain can enforce role separation without every
/// caller having to know the mapping (spec.md §4.3, §4.4).
pub struct MACIValidationStrategy {
    pub enforcer: MACIEnforcer,
}

impl MACIValidationStrategy {
    pub fn new(enforcer: MACIEnforcer) -> Self {
        Self { enforcer }
    }

    fn action_for(message_type: MessageType) -> Option<MACIAction> {
        match message_type {
            MessageType::GovernanceRequest => Some(MACIAction::Propose),
            MessageType::ConstitutionalValidation => Some(MACIAction::Validate),
            MessageType::TaskRequest => Some(MACIAction::Synthesize),
            MessageType::Query => Some(MACIAction::Query),
            MessageType::AuditLog => Some(MACIAction::Audit),
            _ => None,
        }
    }

    pub async fn validate(&self, message: &AgentMessage) -> BusResult<()> {
        let Some(action) = Self::action_for(message.message_type) else {
            return if self.enforcer.strict_mode {
                Err(BusError::RoleSeparation(format!(
                    "no MACI action mapping for message type {:?}",
                    message.message_type
                )))
            } else {
                Ok(())
            };
        };

        let target_output_id = message
            .content
            .get("target_output_id")
            .and_then(|v| v.as_str());

        self.enforcer
            .validate_action(&message.from_agent, action, target_output_id, Some(&message.to_agent))
            .await?;
        Ok(())
    }
}

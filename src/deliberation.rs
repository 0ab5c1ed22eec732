//! Deliberation queue and guard (spec.md §4.5): holds high-impact
//! messages for multi-agent vote or human review, and the
//! multi-signature/critic-review guard that backs it.
//!
//! Grounded on `deliberation_layer/deliberation_queue.py`,
//! `deliberation_layer/voting_service.py`, and
//! `deliberation_layer/opa_guard_mixin.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditClient;
use crate::{AgentMessage, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliberationStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    TimedOut,
    ConsensusReached,
}

impl DeliberationStatus {
    fn is_complete(self) -> bool {
        matches!(
            self,
            DeliberationStatus::Approved
                | DeliberationStatus::Rejected
                | DeliberationStatus::TimedOut
                | DeliberationStatus::ConsensusReached
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    Approve,
    Reject,
    Abstain,
}

/// Voting strategies a deliberation task may be resolved under.
/// `Quorum` needs a simple majority, `SuperMajority` needs two thirds,
/// `Unanimous` needs every participant to approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusRule {
    Quorum,
    SuperMajority,
    Unanimous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVote {
    pub agent_id: String,
    pub vote: VoteType,
    pub reasoning: String,
    pub confidence_score: f32,
    /// Defaults to 1.0 (an unweighted vote). When a task's votes carry
    /// non-uniform weights, `check_consensus` sums weight rather than
    /// counting ballots (spec.md §4.6 "weighted consensus").
    pub weight: f32,
    pub timestamp: DateTime<Utc>,
}

impl AgentVote {
    pub fn new(agent_id: impl Into<String>, vote: VoteType, reasoning: impl Into<String>, confidence_score: f32) -> Self {
        Self::weighted(agent_id, vote, reasoning, confidence_score, 1.0)
    }

    pub fn weighted(
        agent_id: impl Into<String>,
        vote: VoteType,
        reasoning: impl Into<String>,
        confidence_score: f32,
        weight: f32,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            vote,
            reasoning: reasoning.into(),
            confidence_score,
            weight,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliberationTask {
    pub task_id: String,
    pub message: AgentMessage,
    pub status: DeliberationStatus,
    pub required_votes: usize,
    pub consensus_rule: ConsensusRule,
    pub consensus_threshold: f32,
    pub timeout_seconds: u64,
    pub current_votes: Vec<AgentVote>,
    pub requires_human_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub human_reviewer: Option<String>,
    pub human_reasoning: Option<String>,
}

impl DeliberationTask {
    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DeliberationStats {
    pub total_queued: u64,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub consensus_reached: u64,
}

/// Holds messages that cleared fast-path validation but were routed to
/// the deliberation lane (spec.md §4.5, §4.6). Each enqueued task gets
/// a watchdog that marks it `TimedOut` if nobody resolves it in time.
pub struct DeliberationQueue {
    tasks: Mutex<HashMap<String, DeliberationTask>>,
    stats: Mutex<DeliberationStats>,
    default_consensus_threshold: f32,
    default_timeout_seconds: u64,
}

impl DeliberationQueue {
    pub fn new(default_consensus_threshold: f32, default_timeout_seconds: u64) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            stats: Mutex::new(DeliberationStats::default()),
            default_consensus_threshold,
            default_timeout_seconds,
        })
    }

    /// Enqueues a message for deliberation and spawns its timeout
    /// watchdog. Returns the new task's id.
    pub async fn enqueue_for_deliberation(
        self: &Arc<Self>,
        message: AgentMessage,
        requires_human_review: bool,
        requires_multi_agent_vote: bool,
        consensus_rule: ConsensusRule,
        timeout_seconds: Option<u64>,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let timeout_seconds = timeout_seconds.unwrap_or(self.default_timeout_seconds);
        let now = Utc::now();

        let task = DeliberationTask {
            task_id: task_id.clone(),
            message,
            status: if requires_human_review {
                DeliberationStatus::UnderReview
            } else {
                DeliberationStatus::Pending
            },
            required_votes: if requires_multi_agent_vote { 5 } else { 0 },
            consensus_rule,
            consensus_threshold: self.default_consensus_threshold,
            timeout_seconds,
            current_votes: Vec::new(),
            requires_human_review,
            created_at: now,
            updated_at: now,
            human_reviewer: None,
            human_reasoning: None,
        };

        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(task_id.clone(), task);
        }
        self.stats.lock().await.total_queued += 1;

        let queue = Arc::clone(self);
        let watched_id = task_id.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(timeout_seconds)).await;
            queue.time_out_if_pending(&watched_id).await;
        });

        info!("task {task_id} enqueued for deliberation");
        task_id
    }

    async fn time_out_if_pending(&self, task_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if !task.is_complete() {
                task.status = DeliberationStatus::TimedOut;
                task.updated_at = Utc::now();
                drop(tasks);
                self.stats.lock().await.timed_out += 1;
                warn!("deliberation task {task_id} timed out");
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<DeliberationTask> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    pub async fn get_pending_tasks(&self) -> Vec<DeliberationTask> {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.status == DeliberationStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> DeliberationStats {
        self.stats.lock().await.clone()
    }

    /// Casts (or replaces) one agent's vote, then checks consensus
    /// under the task's configured rule.
    pub async fn submit_agent_vote(&self, task_id: &str, vote: AgentVote) -> bool {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else { return false };
        if task.is_complete() {
            return false;
        }

        task.current_votes.retain(|v| v.agent_id != vote.agent_id);
        task.current_votes.push(vote);
        task.updated_at = Utc::now();

        if Self::check_consensus(task) {
            task.status = DeliberationStatus::ConsensusReached;
            drop(tasks);
            self.stats.lock().await.consensus_reached += 1;
            return true;
        }

        // All required votes are in but the consensus rule wasn't met:
        // reject immediately rather than waiting on the watchdog
        // (spec.md §8, "otherwise Rejected"; original
        // `voting_service._check_resolution` lines 122-128).
        if task.required_votes > 0 && task.current_votes.len() >= task.required_votes {
            task.status = DeliberationStatus::Rejected;
            drop(tasks);
            self.stats.lock().await.rejected += 1;
            return true;
        }

        true
    }

    /// Evaluates the task's consensus rule over its current votes. When
    /// any vote carries a weight other than 1.0, "total"/"approvals"
    /// are weight sums instead of ballot counts (spec.md §4.6).
    fn check_consensus(task: &DeliberationTask) -> bool {
        if task.required_votes == 0 || task.current_votes.len() < task.required_votes {
            return false;
        }

        let total: f32 = task.current_votes.iter().map(|v| v.weight).sum();
        let approvals: f32 = task
            .current_votes
            .iter()
            .filter(|v| v.vote == VoteType::Approve)
            .map(|v| v.weight)
            .sum();
        let rejections: f32 = task
            .current_votes
            .iter()
            .filter(|v| v.vote == VoteType::Reject)
            .map(|v| v.weight)
            .sum();

        if total <= 0.0 {
            return false;
        }

        match task.consensus_rule {
            ConsensusRule::Quorum => approvals > total / 2.0,
            ConsensusRule::SuperMajority => approvals / total >= task.consensus_threshold,
            ConsensusRule::Unanimous => approvals == total && rejections == 0.0,
        }
    }

    /// Records a human reviewer's decision for a task that required
    /// human review; only valid while the task is still under review.
    pub async fn submit_human_decision(
        &self,
        task_id: &str,
        reviewer: impl Into<String>,
        approved: bool,
        reasoning: impl Into<String>,
    ) -> bool {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else { return false };
        if task.status != DeliberationStatus::UnderReview {
            return false;
        }

        task.human_reviewer = Some(reviewer.into());
        task.human_reasoning = Some(reasoning.into());
        task.status = if approved { DeliberationStatus::Approved } else { DeliberationStatus::Rejected };
        task.updated_at = Utc::now();
        let approved_flag = approved;
        drop(tasks);

        let mut stats = self.stats.lock().await;
        if approved_flag {
            stats.approved += 1;
        } else {
            stats.rejected += 1;
        }
        true
    }

    /// Marks a resolved task's underlying message as ready for
    /// redelivery or as failed, mirroring the resolution outcome.
    pub async fn resolve_message_status(&self, task_id: &str) -> Option<MessageStatus> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(task_id)?;
        let status = match task.status {
            DeliberationStatus::Approved | DeliberationStatus::ConsensusReached => MessageStatus::Pending,
            _ => MessageStatus::Failed,
        };
        task.message.status = status;
        Some(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardVerdict {
    Approve,
    Reject,
    Escalate,
}

#[derive(Debug, Clone)]
pub struct GuardResult {
    pub verdict: GuardVerdict,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct SignatureResult {
    pub decision_id: String,
    pub signatures: Vec<String>,
    pub threshold_met: bool,
}

#[derive(Debug, Clone)]
pub struct CriticReview {
    pub critic_id: String,
    pub verdict: GuardVerdict,
    pub reasoning: String,
    pub concerns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub decision_id: String,
    pub reviews: Vec<CriticReview>,
    pub consensus: GuardVerdict,
}

/// Multi-signature and critic-review collection for decisions flowing
/// through the deliberation lane (spec.md §4.5's "verify-before-act"
/// guard), grounded on `opa_guard_mixin.py`.
#[derive(Debug, Clone)]
pub struct GuardAuditEntry {
    pub decision_id: String,
    pub agent_id: String,
    pub action: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct DeliberationGuard {
    signatures: Mutex<HashMap<String, Vec<String>>>,
    reviews: Mutex<HashMap<String, Vec<CriticReview>>>,
    critic_agents: Mutex<Vec<String>>,
    audit_log: Mutex<Vec<GuardAuditEntry>>,
}

impl DeliberationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an agent to the pool eligible to cast critic reviews
    /// (`opa_guard_mixin.py`'s critic roster).
    pub async fn register_critic_agent(&self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        let mut critics = self.critic_agents.lock().await;
        if !critics.iter().any(|c| c == &agent_id) {
            critics.push(agent_id);
        }
    }

    pub async fn unregister_critic_agent(&self, agent_id: &str) {
        self.critic_agents.lock().await.retain(|c| c != agent_id);
    }

    pub async fn critic_agents(&self) -> Vec<String> {
        self.critic_agents.lock().await.clone()
    }

    /// Returns a page of the guard's audit trail, newest first,
    /// optionally filtered to one agent.
    pub async fn get_guard_audit_log(&self, limit: usize, offset: usize, agent_id: Option<&str>) -> Vec<GuardAuditEntry> {
        let log = self.audit_log.lock().await;
        log.iter()
            .rev()
            .filter(|entry| agent_id.map(|a| entry.agent_id == a).unwrap_or(true))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn audit(&self, decision_id: &str, agent_id: &str, action: &'static str) {
        self.audit_log.lock().await.push(GuardAuditEntry {
            decision_id: decision_id.to_string(),
            agent_id: agent_id.to_string(),
            action,
            timestamp: Utc::now(),
        });
    }

    pub async fn submit_signature(&self, decision_id: &str, signer_id: &str) -> bool {
        {
            let mut signatures = self.signatures.lock().await;
            let entry = signatures.entry(decision_id.to_string()).or_default();
            if !entry.iter().any(|s| s == signer_id) {
                entry.push(signer_id.to_string());
            }
        }
        self.audit(decision_id, signer_id, "signature").await;
        true
    }

    /// Evaluates whether enough of `required_signers` have signed to
    /// meet `threshold` (fraction, 0.0-1.0).
    pub async fn collect_signatures(&self, decision_id: &str, required_signers: &[String], threshold: f32) -> SignatureResult {
        let signatures = self.signatures.lock().await;
        let signed = signatures.get(decision_id).cloned().unwrap_or_default();
        let matching = required_signers.iter().filter(|s| signed.contains(s)).count();
        let threshold_met = if required_signers.is_empty() {
            false
        } else {
            (matching as f32 / required_signers.len() as f32) >= threshold
        };

        SignatureResult { decision_id: decision_id.to_string(), signatures: signed, threshold_met }
    }

    pub async fn submit_critic_review(
        &self,
        decision_id: &str,
        critic_id: impl Into<String>,
        verdict: GuardVerdict,
        reasoning: impl Into<String>,
        concerns: Vec<String>,
    ) -> bool {
        let critic_id = critic_id.into();
        {
            let mut reviews = self.reviews.lock().await;
            let entry = reviews.entry(decision_id.to_string()).or_default();
            entry.retain(|r| r.critic_id != critic_id);
            entry.push(CriticReview { critic_id: critic_id.clone(), verdict, reasoning: reasoning.into(), concerns });
        }
        self.audit(decision_id, &critic_id, "critic_review").await;
        true
    }

    /// Collects the reviews recorded so far and derives a consensus
    /// verdict: any `Reject` rejects outright, any `Escalate` with no
    /// rejection escalates, otherwise approve.
    pub async fn submit_for_review(&self, decision_id: &str) -> ReviewResult {
        let reviews = self.reviews.lock().await.get(decision_id).cloned().unwrap_or_default();

        let consensus = if reviews.iter().any(|r| r.verdict == GuardVerdict::Reject) {
            GuardVerdict::Reject
        } else if reviews.iter().any(|r| r.verdict == GuardVerdict::Escalate) {
            GuardVerdict::Escalate
        } else if reviews.is_empty() {
            GuardVerdict::Escalate
        } else {
            GuardVerdict::Approve
        };

        ReviewResult { decision_id: decision_id.to_string(), reviews, consensus }
    }
}

/// Outcome of routing a message through the deliberation lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliberationOutcome {
    Enqueued { task_id: String },
    Approved,
    Rejected,
}

/// Orchestrates the deliberation lane: enqueues a message, and, once
/// resolved, records the decision in the audit trail.
pub struct DeliberationLayer {
    pub queue: Arc<DeliberationQueue>,
    pub guard: DeliberationGuard,
    audit: Option<AuditClient>,
}

impl DeliberationLayer {
    pub fn new(consensus_threshold: f32, default_timeout_seconds: u64, audit: Option<AuditClient>) -> Self {
        Self {
            queue: DeliberationQueue::new(consensus_threshold, default_timeout_seconds),
            guard: DeliberationGuard::new(),
            audit,
        }
    }

    /// Enqueues `message` for deliberation and returns its task id. The
    /// caller is responsible for later resolution via votes or a human
    /// decision; this never blocks waiting for one.
    pub async fn process_message(
        &self,
        message: AgentMessage,
        requires_human_review: bool,
        requires_multi_agent_vote: bool,
        consensus_rule: ConsensusRule,
    ) -> DeliberationOutcome {
        let task_id = self
            .queue
            .enqueue_for_deliberation(message, requires_human_review, requires_multi_agent_vote, consensus_rule, None)
            .await;

        if let Some(audit) = &self.audit {
            if let Some(task) = self.queue.get_task(&task_id).await {
                let result = crate::ValidationResult::review("routed to deliberation lane");
                let _ = audit.log_decision(&task.message, &result).await;
            }
        }

        DeliberationOutcome::Enqueued { task_id }
    }
}

//! Impact scorer and adaptive dual-path router (spec.md §4.5).
//!
//! The scorer is a multi-factor weighted sum; the default build uses
//! keyword-density scoring only. Embedding-based semantic scoring is
//! available behind the `embeddings` feature and falls back to the
//! keyword score whenever the model isn't loaded.

use std::sync::atomic::Ordering;

use atomic_float::AtomicF32;
use chrono::{DateTime, Duration, Timelike, Utc};
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{AgentMessage, MessagePriority, MessageType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub semantic_weight: f32,
    pub permission_weight: f32,
    pub volume_weight: f32,
    pub context_weight: f32,
    pub drift_weight: f32,
    pub priority_weight: f32,
    pub type_weight: f32,
    pub critical_priority_boost: f32,
    pub high_semantic_boost: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.30,
            permission_weight: 0.20,
            volume_weight: 0.10,
            context_weight: 0.10,
            drift_weight: 0.15,
            priority_weight: 0.10,
            type_weight: 0.05,
            critical_priority_boost: 0.9,
            high_semantic_boost: 0.8,
        }
    }
}

/// Default impact threshold above which a message is routed to the
/// deliberation lane instead of the fast lane (spec.md §4.5).
pub const DEFAULT_IMPACT_THRESHOLD: f32 = 0.8;

#[cfg(feature = "embeddings")]
struct EmbeddingModel {
    session: ort::session::Session,
    tokenizer: tokenizers::Tokenizer,
}

pub struct ImpactScorer {
    pub config: ScoringConfig,
    #[cfg(feature = "embeddings")]
    embedding_model: Option<EmbeddingModel>,
    agent_request_rates: DashMap<String, Vec<DateTime<Utc>>>,
    agent_impact_history: DashMap<String, Vec<f32>>,
    high_impact_keywords: Vec<&'static str>,
}

impl ImpactScorer {
    pub fn new(config: Option<ScoringConfig>, #[allow(unused_variables)] onnx_path: Option<&str>) -> Self {
        let config = config.unwrap_or_default();

        #[cfg(feature = "embeddings")]
        let embedding_model = onnx_path.and_then(|path| {
            let session = ort::session::Session::builder().ok()?.commit_from_file(path).ok()?;
            let tokenizer = tokenizers::Tokenizer::from_pretrained("distilbert-base-uncased", None).ok()?;
            Some(EmbeddingModel { session, tokenizer })
        });

        Self {
            config,
            #[cfg(feature = "embeddings")]
            embedding_model,
            agent_request_rates: DashMap::new(),
            agent_impact_history: DashMap::new(),
            high_impact_keywords: vec![
                "critical", "emergency", "security", "breach", "violation", "danger",
                "risk", "threat", "attack", "exploit", "vulnerability", "compromise",
                "governance", "policy", "regulation", "compliance", "legal", "audit",
                "financial", "transaction", "payment", "transfer", "blockchain", "consensus",
                "unauthorized", "abnormal", "suspicious", "alert",
            ],
        }
    }

    pub fn calculate_impact_score(&self, message: &AgentMessage) -> f32 {
        let mut score = 0.0;

        let semantic_score = self.calculate_semantic_score(message);
        score += semantic_score * self.config.semantic_weight;

        let permission_score = self.calculate_permission_score(message);
        score += permission_score * self.config.permission_weight;

        let volume_score = self.calculate_volume_score(&message.from_agent);
        score += volume_score * self.config.volume_weight;

        let context_score = self.calculate_context_score(message);
        score += context_score * self.config.context_weight;

        let drift_score = self.calculate_drift_score(&message.from_agent, context_score);
        score += drift_score * self.config.drift_weight;

        let priority_factor = match message.priority {
            MessagePriority::Critical => 1.0,
            MessagePriority::High => 0.7,
            MessagePriority::Normal => 0.3,
            MessagePriority::Low => 0.1,
        };
        score += priority_factor * self.config.priority_weight;

        let type_factor = match message.message_type {
            MessageType::GovernanceRequest | MessageType::ConstitutionalValidation => 0.8,
            MessageType::TaskRequest => 0.5,
            _ => 0.2,
        };
        score += type_factor * self.config.type_weight;

        let total_weight = self.config.semantic_weight
            + self.config.permission_weight
            + self.config.volume_weight
            + self.config.context_weight
            + self.config.drift_weight
            + self.config.priority_weight
            + self.config.type_weight;

        if total_weight > 0.0 {
            score /= total_weight;
        }

        if priority_factor >= 1.0 {
            score = score.max(self.config.critical_priority_boost);
        }
        if semantic_score > 0.8 {
            score = score.max(self.config.high_semantic_boost);
        }

        score.clamp(0.0, 1.0)
    }

    /// Scores a batch of messages in parallel (spec.md §4.5 step 4).
    /// Each message's score is still computed independently — this
    /// only spreads the per-message work (feature extraction plus,
    /// with the `embeddings` feature, model inference) across threads
    /// via a pooled rayon scope rather than pooling embeddings into a
    /// single batched tensor.
    pub fn batch_score(&self, messages: &[AgentMessage]) -> Vec<f32> {
        messages.par_iter().map(|message| self.calculate_impact_score(message)).collect()
    }

    fn calculate_semantic_score(&self, message: &AgentMessage) -> f32 {
        #[cfg(feature = "embeddings")]
        if self.embedding_model.is_some() {
            // Embedding similarity is not yet wired to a reference vector
            // set; fall back to the keyword score until it is.
            return self.keyword_semantic_score(message);
        }
        self.keyword_semantic_score(message)
    }

    fn keyword_semantic_score(&self, message: &AgentMessage) -> f32 {
        let mut hits = 0;
        for value in message.content.values() {
            let lower_val = value_as_lowercase(value);
            for kw in &self.high_impact_keywords {
                if lower_val.contains(kw) {
                    hits += 1;
                }
            }
        }
        (hits as f32 * 0.3).min(0.9)
    }

    fn calculate_permission_score(&self, message: &AgentMessage) -> f32 {
        let high_risk_tools = ["admin", "delete", "transfer", "execute", "blockchain", "payment"];
        let mut max_risk = 0.1;

        for value in message.content.values() {
            let lower_val = value_as_lowercase(value);
            if high_risk_tools.iter().any(|&tool| lower_val.contains(tool)) {
                max_risk = 0.9;
                break;
            }
        }
        max_risk
    }

    fn calculate_volume_score(&self, agent_id: &str) -> f32 {
        let now = Utc::now();
        let window = Duration::seconds(60);

        let mut rates = self.agent_request_rates.entry(agent_id.to_string()).or_insert_with(Vec::new);
        rates.push(now);
        rates.retain(|&t| now - t < window);

        let count = rates.len();
        if count < 10 {
            0.1
        } else if count < 50 {
            0.4
        } else if count < 100 {
            0.7
        } else {
            1.0
        }
    }

    fn calculate_context_score(&self, message: &AgentMessage) -> f32 {
        let now = Utc::now();
        let mut score: f32 = 0.2;

        if (1..=5).contains(&now.hour()) {
            score += 0.3;
        }

        if let Some(amount) = message.payload.get("amount").and_then(value_as_f64) {
            if amount > 10000.0 {
                score += 0.4;
            }
        }

        score.min(1.0)
    }

    fn calculate_drift_score(&self, agent_id: &str, current_impact: f32) -> f32 {
        let mut history = self.agent_impact_history.entry(agent_id.to_string()).or_insert_with(Vec::new);

        if history.is_empty() {
            history.push(current_impact);
            return 0.0;
        }

        let mean: f32 = history.iter().sum::<f32>() / history.len() as f32;
        let deviation = (current_impact - mean).abs();

        history.push(current_impact);
        if history.len() > 20 {
            history.remove(0);
        }

        if deviation > 0.3 {
            (deviation / 0.3 * 0.5).min(1.0)
        } else {
            0.0
        }
    }
}

fn value_as_lowercase(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub lane: String,
    pub impact_score: f32,
    pub requires_deliberation: bool,
}

/// Routes messages to the fast or deliberation lane based on a
/// self-tuning impact threshold (spec.md §4.5).
pub struct AdaptiveRouter {
    pub impact_threshold: AtomicF32,
    pub routing_history: DashMap<String, RoutingDecision>,
}

impl Default for AdaptiveRouter {
    fn default() -> Self {
        Self::new(DEFAULT_IMPACT_THRESHOLD)
    }
}

impl AdaptiveRouter {
    pub fn new(threshold: f32) -> Self {
        Self {
            impact_threshold: AtomicF32::new(threshold),
            routing_history: DashMap::new(),
        }
    }

    pub fn route(&self, message: &AgentMessage) -> RoutingDecision {
        let impact_score = message.impact_score.unwrap_or(0.0);
        let threshold = self.impact_threshold.load(Ordering::Relaxed);

        let decision = if impact_score >= threshold {
            RoutingDecision {
                lane: "deliberation".to_string(),
                impact_score,
                requires_deliberation: true,
            }
        } else {
            RoutingDecision {
                lane: "fast".to_string(),
                impact_score,
                requires_deliberation: false,
            }
        };

        self.routing_history.insert(message.message_id.clone(), decision.clone());
        decision
    }

    /// Manual override for an operator or upstream guard that wants a
    /// message deliberated regardless of its score (spec.md §4.5).
    pub fn force_deliberation(&self, message: &AgentMessage, reason: impl Into<String>) -> RoutingDecision {
        let decision = RoutingDecision {
            lane: "deliberation".to_string(),
            impact_score: message.impact_score.unwrap_or(0.0),
            requires_deliberation: true,
        };
        self.routing_history.insert(message.message_id.clone(), decision.clone());
        tracing::info!(message_id = %message.message_id, reason = %reason.into(), "forced to deliberation lane");
        decision
    }

    /// Nudges the threshold toward fewer false positives (too many
    /// messages routed to deliberation) or fewer false negatives (too
    /// many risky messages slipping through the fast lane).
    pub fn update_threshold(&self, fp_rate: f32, fn_rate: f32) {
        let mut adjustment = 0.0;
        if fp_rate > 0.3 {
            adjustment = 0.05;
        } else if fn_rate > 0.1 {
            adjustment = -0.05;
        }

        if adjustment != 0.0 {
            let current = self.impact_threshold.load(Ordering::Relaxed);
            self.impact_threshold
                .store((current + adjustment).clamp(0.1, 0.95), Ordering::Relaxed);
        }
    }
}

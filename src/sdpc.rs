//! Structural verification hooks (spec.md §4.7): heuristic
//! self-consistency, context-grounding, and adversarial-critique
//! checks that run before a response is accepted, plus the evolution
//! controller that tunes a per-intent prompt branch on repeated
//! failure.
//!
//! Grounded on `sdpc/asc_verifier.py`, `sdpc/pacar_verifier.py`, and
//! `sdpc/evolution_controller.py`. Those originals delegate the actual
//! judgment to an LLM; that call is out of scope here; these
//! verifiers are the deterministic, structural half of the same
//! checks — lexical overlap and grounding rather than model critique.

use std::collections::HashMap;

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentType {
    Factual,
    Creative,
    Reasoning,
    General,
}

/// Classifies intent from surface features of the request text. A
/// coarse stand-in for the richer classifier the original system runs
/// the response through before picking a verification profile.
pub fn classify_intent(text: &str) -> IntentType {
    let lower = text.to_lowercase();
    let reasoning_markers = ["why", "because", "therefore", "step by step", "prove"];
    let factual_markers = ["when did", "who is", "what is", "how many", "define"];
    let creative_markers = ["write a story", "poem", "imagine", "pretend"];

    if creative_markers.iter().any(|m| lower.contains(m)) {
        IntentType::Creative
    } else if factual_markers.iter().any(|m| lower.contains(m)) {
        IntentType::Factual
    } else if reasoning_markers.iter().any(|m| lower.contains(m)) {
        IntentType::Reasoning
    } else {
        IntentType::General
    }
}

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub is_valid: bool,
    pub confidence: f32,
    pub reason: String,
}

impl VerificationOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self { is_valid: true, confidence: 1.0, reason: reason.into() }
    }
}

/// Atomic self-consistency check (spec.md §4.7): only runs for
/// factual/reasoning intents, and flags content whose claims don't
/// reappear anywhere in the supplied grounding context.
pub struct AtomicConsistencyVerifier {
    min_overlap_ratio: f32,
}

impl Default for AtomicConsistencyVerifier {
    fn default() -> Self {
        Self { min_overlap_ratio: 0.3 }
    }
}

impl AtomicConsistencyVerifier {
    pub fn new(min_overlap_ratio: f32) -> Self {
        Self { min_overlap_ratio }
    }

    pub fn verify(&self, content: &str, intent: IntentType, grounding_context: &str) -> VerificationOutcome {
        if !matches!(intent, IntentType::Factual | IntentType::Reasoning) {
            return VerificationOutcome::skipped("consistency check skipped for this intent");
        }

        if grounding_context.trim().is_empty() {
            return VerificationOutcome { is_valid: true, confidence: 0.5, reason: "no grounding context supplied".into() };
        }

        let overlap = token_overlap_ratio(content, grounding_context);
        let is_valid = overlap >= self.min_overlap_ratio;
        VerificationOutcome {
            is_valid,
            confidence: overlap,
            reason: format!("token overlap with grounding context: {overlap:.2}"),
        }
    }
}

fn token_overlap_ratio(content: &str, context: &str) -> f32 {
    let content_tokens: std::collections::HashSet<String> =
        content.to_lowercase().split_whitespace().map(str::to_string).collect();
    if content_tokens.is_empty() {
        return 0.0;
    }
    let context_tokens: std::collections::HashSet<String> =
        context.to_lowercase().split_whitespace().map(str::to_string).collect();

    let matching = content_tokens.intersection(&context_tokens).count();
    matching as f32 / content_tokens.len() as f32
}

/// Adversarial critique check (spec.md §4.7): scans for hedging or
/// self-contradiction markers a red-team pass would flag, as a
/// deterministic substitute for the original's LLM-driven critique.
pub struct AdversarialCritiqueVerifier {
    risk_markers: Vec<&'static str>,
}

impl Default for AdversarialCritiqueVerifier {
    fn default() -> Self {
        Self {
            risk_markers: vec![
                "i'm not sure",
                "i am not sure",
                "cannot verify",
                "may be incorrect",
                "contradicts",
                "unable to confirm",
            ],
        }
    }
}

impl AdversarialCritiqueVerifier {
    pub fn verify(&self, content: &str) -> VerificationOutcome {
        let lower = content.to_lowercase();
        let hits: Vec<&str> = self.risk_markers.iter().copied().filter(|m| lower.contains(m)).collect();

        if hits.is_empty() {
            VerificationOutcome { is_valid: true, confidence: 0.9, reason: "no risk markers found".into() }
        } else {
            VerificationOutcome {
                is_valid: false,
                confidence: 1.0 - (0.2 * hits.len() as f32).min(0.9),
                reason: format!("risk markers present: {}", hits.join(", ")),
            }
        }
    }
}

/// Tracks consecutive verification failures per intent branch and
/// emits corrective mutation instructions once a threshold is crossed
/// (spec.md §4.7), grounded on `sdpc/evolution_controller.py`.
pub struct EvolutionController {
    failure_threshold: u32,
    failure_history: Mutex<HashMap<IntentType, u32>>,
    mutations: Mutex<HashMap<IntentType, Vec<String>>>,
}

impl Default for EvolutionController {
    fn default() -> Self {
        Self::new(3)
    }
}

impl EvolutionController {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            failure_history: Mutex::new(HashMap::new()),
            mutations: Mutex::new(HashMap::new()),
        }
    }

    /// Records whether every supplied verification passed for this
    /// intent and, on crossing the failure threshold, appends a
    /// corrective mutation and resets the counter.
    pub async fn record_feedback(&self, intent: IntentType, all_passed: bool) {
        let mut history = self.failure_history.lock().await;
        let count = history.entry(intent).or_insert(0);

        if all_passed {
            *count = 0;
            return;
        }

        *count += 1;
        if *count >= self.failure_threshold {
            let instruction = mutation_for(intent);
            drop(history);
            let mut mutations = self.mutations.lock().await;
            let entry = mutations.entry(intent).or_default();
            if !entry.iter().any(|m| m == instruction) {
                entry.push(instruction.to_string());
            }
            self.failure_history.lock().await.insert(intent, 0);
        }
    }

    pub async fn mutations_for(&self, intent: IntentType) -> Vec<String> {
        self.mutations.lock().await.get(&intent).cloned().unwrap_or_default()
    }

    pub async fn reset(&self, intent: Option<IntentType>) {
        match intent {
            Some(intent) => {
                self.mutations.lock().await.remove(&intent);
                self.failure_history.lock().await.remove(&intent);
            }
            None => {
                self.mutations.lock().await.clear();
                self.failure_history.lock().await.clear();
            }
        }
    }
}

fn mutation_for(intent: IntentType) -> &'static str {
    match intent {
        IntentType::Factual => "extreme grounding enforced: cross-verify every date and location",
        IntentType::Reasoning => "chain-of-thought verified: list logical dependencies between steps",
        IntentType::Creative => "tone adjustment: increase variety in sentence structure and imagery",
        IntentType::General => "conciseness: reduce verbosity and focus on direct answers",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_factual_question() {
        assert_eq!(classify_intent("what is the capital of France?"), IntentType::Factual);
    }

    #[test]
    fn classifies_creative_request() {
        assert_eq!(classify_intent("write a story about a dragon"), IntentType::Creative);
    }

    #[test]
    fn consistency_check_skipped_for_creative() {
        let verifier = AtomicConsistencyVerifier::default();
        let outcome = verifier.verify("a tale of dragons", IntentType::Creative, "");
        assert!(outcome.is_valid);
    }

    #[test]
    fn consistency_check_flags_ungrounded_factual_claim() {
        let verifier = AtomicConsistencyVerifier::new(0.5);
        let outcome = verifier.verify("the treaty was signed in 1850", IntentType::Factual, "unrelated context about cooking");
        assert!(!outcome.is_valid);
    }

    #[test]
    fn critique_flags_hedging_language() {
        let verifier = AdversarialCritiqueVerifier::default();
        let outcome = verifier.verify("I'm not sure, but this may be incorrect.");
        assert!(!outcome.is_valid);
    }

    #[tokio::test]
    async fn evolution_controller_triggers_mutation_after_threshold() {
        let controller = EvolutionController::new(2);
        controller.record_feedback(IntentType::Factual, false).await;
        controller.record_feedback(IntentType::Factual, false).await;

        let mutations = controller.mutations_for(IntentType::Factual).await;
        assert_eq!(mutations.len(), 1);
    }

    #[tokio::test]
    async fn evolution_controller_resets_on_success() {
        let controller = EvolutionController::new(2);
        controller.record_feedback(IntentType::Reasoning, false).await;
        controller.record_feedback(IntentType::Reasoning, true).await;
        controller.record_feedback(IntentType::Reasoning, false).await;

        let mutations = controller.mutations_for(IntentType::Reasoning).await;
        assert!(mutations.is_empty());
    }
}

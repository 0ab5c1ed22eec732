use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::CONSTITUTIONAL_HASH;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
    Review,
}

/// Accumulates validation outcomes across the strategy chain. Built via
/// `add_error`/`add_warning`/`merge`, never constructed already-failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub decision: Decision,
    pub constitutional_hash: String,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: HashMap::new(),
            decision: Decision::Allow,
            constitutional_hash: CONSTITUTIONAL_HASH.to_string(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        let mut result = Self::new();
        result.add_error(reason.into());
        result
    }

    pub fn review(reason: impl Into<String>) -> Self {
        let mut result = Self::new();
        result.warnings.push(reason.into());
        result.decision = Decision::Review;
        result
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.is_valid = false;
        self.decision = Decision::Deny;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn merge(&mut self, other: &ValidationResult) {
        self.errors.extend(other.errors.iter().cloned());
        self.warnings.extend(other.warnings.iter().cloned());
        self.metadata.extend(other.metadata.clone());
        if !other.is_valid {
            self.is_valid = false;
            self.decision = Decision::Deny;
        } else if other.decision == Decision::Review && self.decision == Decision::Allow {
            self.decision = Decision::Review;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_error_flips_validity_and_decision() {
        let mut result = ValidationResult::new();
        result.add_error("bad hash");
        assert!(!result.is_valid);
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.errors, vec!["bad hash".to_string()]);
    }

    #[test]
    fn merge_propagates_invalidity() {
        let mut a = ValidationResult::new();
        let mut b = ValidationResult::new();
        b.add_error("denied by policy");
        a.merge(&b);
        assert!(!a.is_valid);
        assert_eq!(a.errors.len(), 1);
    }
}

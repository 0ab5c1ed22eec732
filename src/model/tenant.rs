use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::BusError;

static DEFAULT_TENANT_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_\-]{3,64}$").unwrap());

/// Normalizes a raw tenant id: trim, lowercase, empty -> `None`.
/// `Normalize(Normalize(t)) == Normalize(t)` for all `t` (spec.md §8).
pub fn normalize_tenant_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Pluggable tenant format validation. The default implementation uses
/// the reference `[a-z0-9_-]{3,64}` pattern; the policy itself is a
/// Non-goal (spec.md §1), so callers may supply their own.
pub trait TenantValidator: Send + Sync {
    fn validate(&self, normalized: &str) -> Result<(), BusError>;

    fn normalize_and_validate(&self, raw: &str) -> Result<Option<String>, BusError> {
        match normalize_tenant_id(raw) {
            None => Ok(None),
            Some(normalized) => {
                self.validate(&normalized)?;
                Ok(Some(normalized))
            }
        }
    }
}

pub struct DefaultTenantValidator;

impl TenantValidator for DefaultTenantValidator {
    fn validate(&self, normalized: &str) -> Result<(), BusError> {
        if DEFAULT_TENANT_FORMAT.is_match(normalized) {
            Ok(())
        } else {
            Err(BusError::InvalidTenant(format!(
                "tenant id '{normalized}' does not match required format"
            )))
        }
    }
}

/// Consistency rule for send (§4.8): sender, recipient, and message tenant
/// must all agree, or all be absent. Returns one error per offending edge.
pub fn check_tenant_consistency(
    sender_tenant: Option<&str>,
    recipient_tenant: Option<&str>,
    message_tenant: Option<&str>,
) -> Result<(), BusError> {
    let mut mismatches = Vec::new();

    if sender_tenant != message_tenant {
        mismatches.push(format!(
            "sender tenant {sender_tenant:?} does not match message tenant {message_tenant:?}"
        ));
    }
    if recipient_tenant != message_tenant {
        mismatches.push(format!(
            "recipient tenant {recipient_tenant:?} does not match message tenant {message_tenant:?}"
        ));
    }
    if sender_tenant != recipient_tenant {
        mismatches.push(format!(
            "sender tenant {sender_tenant:?} does not match recipient tenant {recipient_tenant:?}"
        ));
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(BusError::TenantInconsistency(mismatches.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_tenant_id("  Acme  "), Some("acme".to_string()));
    }

    #[test]
    fn normalize_empty_is_none() {
        assert_eq!(normalize_tenant_id("   "), None);
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_tenant_id("  Acme-Corp_1 ").unwrap();
        let twice = normalize_tenant_id(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn default_validator_rejects_short_ids() {
        let validator = DefaultTenantValidator;
        assert!(validator.validate("ab").is_err());
        assert!(validator.validate("acme").is_ok());
    }

    #[test]
    fn consistency_passes_when_all_match() {
        assert!(check_tenant_consistency(Some("acme"), Some("acme"), Some("acme")).is_ok());
    }

    #[test]
    fn consistency_fails_cross_tenant() {
        let err = check_tenant_consistency(Some("acme"), Some("globex"), Some("acme"));
        assert!(err.is_err());
    }

    #[test]
    fn consistency_passes_when_all_absent() {
        assert!(check_tenant_consistency(None, None, None).is_ok());
    }
}

use once_cell::sync::Lazy;
use regex::Regex;

use crate::CONSTITUTIONAL_HASH_LEN;

static URI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s]+").unwrap());

static CREDENTIAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(key|secret|token|password|auth|pwd)\s*=\s*\S+").unwrap()
});

static ABSOLUTE_PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:/[\w.\-]+){2,}").unwrap());

/// Masks URIs, credential-shaped `key=value` pairs, and absolute
/// filesystem paths in a message destined for a caller.
pub fn redact_error_message(message: &str) -> String {
    let masked = URI_PATTERN.replace_all(message, "[REDACTED_URI]");
    let masked = CREDENTIAL_PATTERN.replace_all(&masked, "[REDACTED]");
    let masked = ABSOLUTE_PATH_PATTERN.replace_all(&masked, "[REDACTED_PATH]");
    masked.into_owned()
}

/// Truncates a full constitutional hash to an 8-character prefix so a
/// rejection message never leaks the canonical value in full.
pub fn truncated_hash(hash: &str) -> String {
    hash.chars().take(CONSTITUTIONAL_HASH_LEN / 2).collect()
}

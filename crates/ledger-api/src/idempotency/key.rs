use uuid::Uuid;

const CANONICAL_LEN: usize = 36;

/// Accepts only the canonical hyphenated UUID form (8-4-4-4-12 hex digits).
///
/// Simple, braced and URN spellings are rejected even though `uuid` would
/// parse them.
pub fn is_valid_key(key: &str) -> bool {
    if key.trim().is_empty() || key.len() != CANONICAL_LEN {
        return false;
    }

    Uuid::try_parse(key).is_ok()
}

//! Validation helpers for DTOs.

use validator::ValidationError;

/// Longest accepted `X-Idempotency-Key` header value.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Largest accepted magnitude for a single score delta.
pub const MAX_DELTA: u64 = 1_000_000_000;

/// Validates that a score delta is non-zero and within `±MAX_DELTA`.
pub fn validate_delta(delta: i64) -> Result<(), ValidationError> {
    if delta == 0 {
        let mut err = ValidationError::new("delta_zero");
        err.message = Some("Delta must be non-zero".into());
        return Err(err);
    }
    if delta.unsigned_abs() > MAX_DELTA {
        let mut err = ValidationError::new("delta_range");
        err.message = Some(format!("Delta must be between -{MAX_DELTA} and {MAX_DELTA}").into());
        return Err(err);
    }
    Ok(())
}

/// Validates an upstream target id: 1 to 128 characters, not a relative path segment.
pub fn validate_target_id(target_id: &str) -> Result<(), ValidationError> {
    if target_id.is_empty() || target_id.chars().count() > 128 {
        let mut err = ValidationError::new("target_id_length");
        err.message = Some("Target id must be 1 to 128 characters".into());
        return Err(err);
    }
    if target_id == "." || target_id == ".." {
        let mut err = ValidationError::new("target_id_format");
        err.message = Some("Target id must not be '.' or '..'".into());
        return Err(err);
    }
    Ok(())
}

/// Validates a request idempotency key: 1 to 128 visible ASCII characters.
///
/// # Examples
///
/// ```ignore
/// validate_idempotency_key("req-2024-01") // Ok
/// validate_idempotency_key("")            // Err - empty
/// validate_idempotency_key("two words")   // Err - space
/// ```
pub fn validate_idempotency_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        let mut err = ValidationError::new("idempotency_key_length");
        err.message = Some(
            format!(
                "Idempotency key must be 1 to {MAX_IDEMPOTENCY_KEY_LEN} characters (got {})",
                key.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !key.chars().all(|c| c.is_ascii_graphic()) {
        let mut err = ValidationError::new("idempotency_key_format");
        err.message = Some("Idempotency key must contain only visible ASCII characters".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delta_is_rejected() {
        assert!(validate_delta(0).is_err());
        assert!(validate_delta(-4).is_ok());
        assert!(validate_delta(7).is_ok());
    }

    #[test]
    fn delta_magnitude_is_bounded() {
        assert!(validate_delta(1_000_000_000).is_ok());
        assert!(validate_delta(-1_000_000_000).is_ok());
        assert!(validate_delta(1_000_000_001).is_err());
        assert!(validate_delta(i64::MAX).is_err());
        assert!(validate_delta(i64::MIN).is_err());
    }

    #[test]
    fn target_id_rejects_dot_segments() {
        assert!(validate_target_id("p-1").is_ok());
        assert!(validate_target_id("a/b").is_ok());
        assert!(validate_target_id(".").is_err());
        assert!(validate_target_id("..").is_err());
        assert!(validate_target_id("").is_err());
        assert!(validate_target_id(&"t".repeat(129)).is_err());
    }

    #[test]
    fn idempotency_key_length_is_bounded() {
        assert!(validate_idempotency_key("req-1").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(&"k".repeat(129)).is_err());
        assert!(validate_idempotency_key(&"k".repeat(128)).is_ok());
    }

    #[test]
    fn idempotency_key_rejects_whitespace_and_non_ascii() {
        assert!(validate_idempotency_key("two words").is_err());
        assert!(validate_idempotency_key("clé").is_err());
        assert!(validate_idempotency_key("tab\tkey").is_err());
    }
}

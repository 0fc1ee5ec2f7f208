//! Utility functions shared across the orchestrator's subsystems.

use std::time::{SystemTime, UNIX_EPOCH};

/// Validate agent ID format: non-empty, alphanumeric/hyphen/underscore,
/// bounded length. Grounded on the teacher's `validate_agent_id`, applied
/// here to the agent's display name rather than its identity (identity is
/// a `Uuid`, see `model::Agent::id`).
pub fn validate_agent_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::OrchestratorError::Validation("agent name cannot be empty".to_string()).into());
    }
    if name.len() > 128 {
        return Err(crate::OrchestratorError::Validation(
            "agent name cannot be longer than 128 characters".to_string(),
        )
        .into());
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(crate::OrchestratorError::Validation(
            "agent name can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }
    Ok(())
}

/// Current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Exponential backoff delay for connection recovery (§4.1.5, §5):
/// attempt *k* sleeps `base · multiplier^(k−1)`.
pub fn recovery_backoff_seconds(attempt: u32, base_seconds: u64, multiplier: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    base_seconds.saturating_mul(multiplier.saturating_pow(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_name_rejects_empty() {
        assert!(validate_agent_name("").is_err());
    }

    #[test]
    fn agent_name_accepts_reasonable_values() {
        assert!(validate_agent_name("probe-agent_01").is_ok());
    }

    #[test]
    fn backoff_matches_spec_sequence() {
        // base=5s, multiplier=2 -> attempts 1,2,3 sleep 5s, 10s, 20s (§8 scenario 2).
        assert_eq!(recovery_backoff_seconds(1, 5, 2), 5);
        assert_eq!(recovery_backoff_seconds(2, 5, 2), 10);
        assert_eq!(recovery_backoff_seconds(3, 5, 2), 20);
    }
}

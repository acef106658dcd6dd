// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Only failures the caller must branch on become error variants. State
// mismatches ("position not found") are encoded as outcome enums on the
// registry API, and per-position evaluation failures (lock timeouts, data
// gaps) are counted and skipped rather than propagated.
// =============================================================================

use thiserror::Error;

/// Errors surfaced by the registry API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request was malformed and nothing was mutated.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// A bounded lock wait expired on an operation that cannot proceed
    /// without the lock.
    #[error("lock wait expired on {resource}")]
    LockTimeout { resource: &'static str },
}

impl EngineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_carries_reason() {
        let err = EngineError::validation("quantity must be positive");
        assert_eq!(
            err.to_string(),
            "validation failed: quantity must be positive"
        );
    }

    #[test]
    fn lock_timeout_names_the_resource() {
        let err = EngineError::LockTimeout {
            resource: "registry index",
        };
        assert_eq!(err.to_string(), "lock wait expired on registry index");
    }
}

//! Verification errors.

use thiserror::Error;

/// Verification result type
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Verification errors
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A configuration value is out of range
    #[error("invalid {field}: {reason}")]
    InvalidConfig {
        /// Offending setting
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Persisted state could not be decoded
    #[error("state decoding failed: {0}")]
    State(#[from] serde_json::Error),
}

impl VerifyError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

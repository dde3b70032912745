//! Core error types for TWINPATH.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid node identifier
    InvalidId { reason: String },

    /// Invalid capability name
    InvalidCapability { reason: String },

    /// Invalid version
    InvalidVersion { reason: String },

    /// Invalid decimal literal
    InvalidDecimal { literal: String },

    /// Invalid fingerprint format
    InvalidFingerprint { reason: String },

    /// Value could not be encoded or decoded
    Encoding { message: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { reason } => write!(f, "Invalid node ID: {}", reason),
            Self::InvalidCapability { reason } => write!(f, "Invalid capability: {}", reason),
            Self::InvalidVersion { reason } => write!(f, "Invalid version: {}", reason),
            Self::InvalidDecimal { literal } => write!(f, "Invalid decimal literal: {}", literal),
            Self::InvalidFingerprint { reason } => write!(f, "Invalid fingerprint: {}", reason),
            Self::Encoding { message } => write!(f, "Encoding error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding {
            message: err.to_string(),
        }
    }
}

//! Uniform result shape returned by every backend.

use crate::value::Fields;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node-level error reported by a backend
///
/// This is a well-formed business result, not a backend failure: the node
/// ran and decided to fail. Two errors agree when code and fields agree;
/// the message is free-form and never compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable explanation
    pub message: String,
    /// Structured details
    #[serde(default)]
    pub fields: Fields,
}

impl NodeError {
    /// Create an error with no detail fields
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            fields: Fields::new(),
        }
    }

    /// Attach detail fields
    #[must_use]
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Success-or-error result of one node invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The node produced output fields
    Success {
        /// Output fields
        fields: Fields,
    },
    /// The node reported an error
    Error(NodeError),
}

impl Outcome {
    /// Successful outcome
    #[must_use]
    pub fn success(fields: Fields) -> Self {
        Self::Success { fields }
    }

    /// Error outcome
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(NodeError::new(code, message))
    }

    /// Check if success
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Output fields of a success, or detail fields of an error
    #[must_use]
    pub fn fields(&self) -> &Fields {
        match self {
            Self::Success { fields } => fields,
            Self::Error(err) => &err.fields,
        }
    }

    /// Tag name used in difference reports
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    #[test]
    fn test_outcome_accessors() {
        let ok = Outcome::success(fields! { "result" => 3 });
        assert!(ok.is_success());
        assert_eq!(ok.tag(), "success");
        assert_eq!(ok.fields()["result"].as_i64(), Some(3));

        let err = Outcome::Error(
            NodeError::new("INSUFFICIENT_FUNDS", "balance too low")
                .with_fields(fields! { "balance" => 5 }),
        );
        assert!(!err.is_success());
        assert_eq!(err.tag(), "error");
        assert_eq!(err.fields()["balance"].as_i64(), Some(5));
    }

    #[test]
    fn test_outcome_serde_tagged() {
        let ok = Outcome::success(fields! { "result" => 3 });
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(json, r#"{"status":"success","fields":{"result":3}}"#);

        let err = Outcome::error("E_BAD", "bad input");
        let json = serde_json::to_string(&err).unwrap();
        let back: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_node_error_display() {
        let err = NodeError::new("E_LIMIT", "limit exceeded");
        assert_eq!(err.to_string(), "E_LIMIT: limit exceeded");
    }
}

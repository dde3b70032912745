//! Routing modes and execution paths.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a node's traffic is split between the two backends
///
/// Ordered from least to most trust in the optimized backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Only the reference backend runs
    ReferenceOnly,
    /// Reference answers; optimized runs in the background for comparison
    Shadow,
    /// A stable slice of traffic is answered by the optimized backend
    Canary,
    /// Both run on every call; reference answers
    DualVerify,
    /// Optimized answers; a sample is still verified against reference
    OptimizedOnly,
}

impl ExecutionMode {
    /// Every mode, in trust order
    pub const ALL: [Self; 5] = [
        Self::ReferenceOnly,
        Self::Shadow,
        Self::Canary,
        Self::DualVerify,
        Self::OptimizedOnly,
    ];

    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReferenceOnly => "reference_only",
            Self::Shadow => "shadow",
            Self::Canary => "canary",
            Self::DualVerify => "dual_verify",
            Self::OptimizedOnly => "optimized_only",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| CoreError::Encoding {
                message: format!("unknown execution mode {:?}", s),
            })
    }
}

/// Which backend produced the returned result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    /// Trusted backend
    Reference,
    /// Performance backend under verification
    Optimized,
}

impl ExecutionPath {
    /// Stable name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Optimized => "optimized",
        }
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_names_roundtrip() {
        for mode in ExecutionMode::ALL {
            assert_eq!(mode.as_str().parse::<ExecutionMode>().unwrap(), mode);
        }
        assert!("turbo".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_mode_serde_snake_case() {
        let json = serde_json::to_string(&ExecutionMode::DualVerify).unwrap();
        assert_eq!(json, "\"dual_verify\"");
        assert_eq!(ExecutionPath::Optimized.to_string(), "optimized");
    }

    #[test]
    fn test_mode_trust_order() {
        assert!(ExecutionMode::ReferenceOnly < ExecutionMode::Canary);
        assert!(ExecutionMode::DualVerify < ExecutionMode::OptimizedOnly);
    }
}

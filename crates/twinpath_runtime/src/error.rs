//! Runtime error types.

use crate::backend::BackendFailure;
use std::path::PathBuf;
use thiserror::Error;
use twinpath_core::{Capability, NodeId};
use twinpath_verify::VerifyError;

/// Errors returned to callers of [`crate::Engine::execute`]
#[derive(Debug, Error)]
pub enum EngineError {
    /// No descriptor is registered under this identifier
    #[error("unknown node: {node_id}")]
    UnknownNode {
        /// Requested node
        node_id: NodeId,
    },

    /// The caller lacks a capability the node requires
    #[error("node {node_id} requires capability {capability}")]
    MissingCapability {
        /// Requested node
        node_id: NodeId,
        /// First missing capability in sorted order
        capability: Capability,
    },

    /// The node's key policy demands an idempotency key
    #[error("node {node_id} requires an idempotency key")]
    MissingIdempotencyKey {
        /// Requested node
        node_id: NodeId,
    },

    /// The authoritative backend failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The request did not finish in time
    #[error("node {node_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Requested node
        node_id: NodeId,
        /// Configured limit
        timeout_ms: u64,
    },
}

impl EngineError {
    /// Whether the failing backend declared the error retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(BackendError::Failed(f)) if f.retryable)
    }
}

impl From<CacheError> for EngineError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Inconsistent { node_id } => {
                Self::Backend(BackendError::DeterminismViolation { node_id })
            }
        }
    }
}

/// Fatal backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend reported a failure
    #[error(transparent)]
    Failed(#[from] BackendFailure),

    /// Two computations for the same fingerprint disagreed
    #[error("determinism violation for node {node_id}: differing results for identical inputs")]
    DeterminismViolation {
        /// Offending node
        node_id: NodeId,
    },
}

/// Capability guard errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// A required capability is not granted
    #[error("missing capability: {capability}")]
    MissingCapability {
        /// First missing capability in sorted order
        capability: Capability,
    },
}

/// Result cache errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A different result is already cached under the same key
    #[error("inconsistent cached result for node {node_id}")]
    Inconsistent {
        /// Offending node
        node_id: NodeId,
    },
}

/// Node registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Descriptor requires a capability it also denies
    #[error("node {node_id} both requires and denies {capability}")]
    CapabilityConflict {
        /// Offending node
        node_id: NodeId,
        /// Conflicting capability
        capability: Capability,
    },

    /// A descriptor with this identifier already exists
    #[error("node {node_id} already registered")]
    AlreadyRegistered {
        /// Offending node
        node_id: NodeId,
    },

    /// Descriptor JSON could not be decoded
    #[error("descriptor parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Config JSON could not be decoded
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A setting is out of range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending setting
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Builder is missing a component
    #[error("engine builder missing {0}")]
    Missing(&'static str),
}

impl From<VerifyError> for ConfigError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::InvalidConfig { field, reason } => Self::Invalid { field, reason },
            VerifyError::State(e) => Self::Parse(e),
        }
    }
}

//! Backend abstraction.
//!
//! The engine never interprets node logic itself. It hands an [`Invocation`]
//! to one or both backends and works with the [`Outcome`] they return.

use crate::descriptor::NodeDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use twinpath_core::{Fields, NodeId, Outcome, Version};

/// A backend could not produce an outcome
///
/// This is distinct from [`Outcome::Error`], which is a well-formed node
/// result and is compared like any other output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{backend} backend failed: {message}")]
pub struct BackendFailure {
    /// Backend name
    pub backend: String,
    /// Failure description
    pub message: String,
    /// Retrying the same call may succeed
    pub retryable: bool,
}

impl BackendFailure {
    /// Create a non-retryable failure
    #[must_use]
    pub fn new(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a retryable failure
    #[must_use]
    pub fn retryable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(backend, message)
        }
    }

    /// The backend does not support the requested operation
    #[must_use]
    pub fn unsupported(backend: impl Into<String>, operation: &str) -> Self {
        Self::new(backend, format!("{operation} not supported"))
    }
}

/// Output of a hot-path compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    /// Artifact identifier
    pub id: String,
    /// Node the artifact was compiled for
    pub node_id: NodeId,
    /// Node version the artifact was compiled for
    pub version: Version,
    /// Backend-specific payload
    pub payload: Vec<u8>,
}

impl CompiledArtifact {
    /// Create an artifact whose id is derived from its payload
    #[must_use]
    pub fn new(node_id: NodeId, version: Version, payload: Vec<u8>) -> Self {
        let digest = twinpath_core::Fingerprint::compute(&payload);
        Self {
            id: hex::encode(&digest.as_bytes()[..8]),
            node_id,
            version,
            payload,
        }
    }
}

/// One call handed to a backend
///
/// Cheap to clone so background tasks can own a copy.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Node being executed
    pub descriptor: Arc<NodeDescriptor>,
    /// Input fields
    pub inputs: Arc<Fields>,
    /// Caller-supplied idempotency key
    pub idempotency_key: Option<String>,
    /// Compiled artifact, when the hot path has one for this version
    pub artifact: Option<Arc<CompiledArtifact>>,
}

impl Invocation {
    /// Create an interpreted invocation
    #[must_use]
    pub fn new(descriptor: Arc<NodeDescriptor>, inputs: Arc<Fields>) -> Self {
        Self {
            descriptor,
            inputs,
            idempotency_key: None,
            artifact: None,
        }
    }

    /// Attach an idempotency key
    #[must_use]
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Attach a compiled artifact
    #[must_use]
    pub fn with_artifact(mut self, artifact: Option<Arc<CompiledArtifact>>) -> Self {
        self.artifact = artifact;
        self
    }

    /// Node identifier
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.descriptor.id
    }
}

/// An execution backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name used in logs, audit events and failures
    fn name(&self) -> &str;

    /// Run one invocation
    ///
    /// # Errors
    ///
    /// Returns [`BackendFailure`] if no outcome could be produced
    async fn invoke(&self, invocation: &Invocation) -> Result<Outcome, BackendFailure>;

    /// Compile a node for the hot path
    ///
    /// # Errors
    ///
    /// Returns [`BackendFailure`] if compilation failed or is unsupported
    async fn compile(&self, descriptor: &NodeDescriptor) -> Result<CompiledArtifact, BackendFailure> {
        let _ = descriptor;
        Err(BackendFailure::unsupported(self.name(), "compile"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Backend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, invocation: &Invocation) -> Result<Outcome, BackendFailure> {
            Ok(Outcome::success((*invocation.inputs).clone()))
        }
    }

    #[tokio::test]
    async fn test_default_compile_unsupported() {
        let descriptor = NodeDescriptor::new(NodeId::new("echo_v1").unwrap(), Version::default());
        let err = Echo.compile(&descriptor).await.unwrap_err();
        assert_eq!(err.backend, "echo");
        assert!(!err.retryable);
        assert_eq!(err.to_string(), "echo backend failed: compile not supported");
    }

    #[test]
    fn test_artifact_id_is_stable() {
        let node = NodeId::new("add_v1").unwrap();
        let a = CompiledArtifact::new(node.clone(), Version::default(), vec![1, 2, 3]);
        let b = CompiledArtifact::new(node, Version::default(), vec![1, 2, 3]);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }
}

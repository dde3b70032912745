//! In-process backends for tests, simulations and the CLI.

use crate::backend::{Backend, BackendFailure, CompiledArtifact, Invocation};
use crate::descriptor::NodeDescriptor;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use twinpath_core::Outcome;

type Handler = dyn Fn(&Invocation) -> Result<Outcome, BackendFailure> + Send + Sync;

/// How [`FnBackend::compile`] behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileBehavior {
    /// Report compilation as unsupported
    Unsupported,
    /// Produce an artifact
    Succeed,
    /// Fail with this message
    Fail(String),
}

/// Backend driven by a closure
pub struct FnBackend {
    name: String,
    handler: Box<Handler>,
    delay: Option<Duration>,
    compile: CompileBehavior,
    compile_delay: Option<Duration>,
    calls: AtomicU64,
    compiled_calls: AtomicU64,
    compiles: AtomicU64,
}

impl std::fmt::Debug for FnBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBackend")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .field("compiles", &self.compiles())
            .finish_non_exhaustive()
    }
}

impl FnBackend {
    /// Create a backend that answers with `handler`
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Invocation) -> Result<Outcome, BackendFailure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(handler),
            delay: None,
            compile: CompileBehavior::Unsupported,
            compile_delay: None,
            calls: AtomicU64::new(0),
            compiled_calls: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
        }
    }

    /// Sleep before every invocation
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set compile behavior
    #[must_use]
    pub fn with_compile(mut self, behavior: CompileBehavior) -> Self {
        self.compile = behavior;
        self
    }

    /// Sleep before every compilation
    #[must_use]
    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = Some(delay);
        self
    }

    /// Invocations so far
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Invocations that carried a compiled artifact
    #[must_use]
    pub fn compiled_calls(&self) -> u64 {
        self.compiled_calls.load(Ordering::SeqCst)
    }

    /// Compilations attempted so far
    #[must_use]
    pub fn compiles(&self) -> u64 {
        self.compiles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FnBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<Outcome, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if invocation.artifact.is_some() {
            self.compiled_calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(invocation)
    }

    async fn compile(&self, descriptor: &NodeDescriptor) -> Result<CompiledArtifact, BackendFailure> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.compile_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.compile {
            CompileBehavior::Unsupported => Err(BackendFailure::unsupported(&self.name, "compile")),
            CompileBehavior::Succeed => Ok(CompiledArtifact::new(
                descriptor.id.clone(),
                descriptor.version,
                format!("{}@{}", descriptor.id, descriptor.version).into_bytes(),
            )),
            CompileBehavior::Fail(message) => Err(BackendFailure::new(&self.name, message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use twinpath_core::{fields, NodeId, Version};

    fn invocation() -> Invocation {
        let descriptor = NodeDescriptor::new(NodeId::new("add_v1").unwrap(), Version::default());
        Invocation::new(Arc::new(descriptor), Arc::new(fields! { "a" => 1 }))
    }

    #[tokio::test]
    async fn test_counts_calls() {
        let backend = FnBackend::new("reference", |inv| Ok(Outcome::success((*inv.inputs).clone())));
        backend.invoke(&invocation()).await.unwrap();
        backend.invoke(&invocation()).await.unwrap();
        assert_eq!(backend.calls(), 2);
        assert_eq!(backend.compiled_calls(), 0);
    }

    #[tokio::test]
    async fn test_compile_behaviors() {
        let descriptor = NodeDescriptor::new(NodeId::new("add_v1").unwrap(), Version::default());
        let ok = FnBackend::new("optimized", |_| Ok(Outcome::success(fields! {})))
            .with_compile(CompileBehavior::Succeed);
        let artifact = ok.compile(&descriptor).await.unwrap();
        assert_eq!(artifact.node_id, descriptor.id);

        let failing = FnBackend::new("optimized", |_| Ok(Outcome::success(fields! {})))
            .with_compile(CompileBehavior::Fail("llvm exploded".to_string()));
        let err = failing.compile(&descriptor).await.unwrap_err();
        assert_eq!(err.message, "llvm exploded");
        assert_eq!(failing.compiles(), 1);
    }
}

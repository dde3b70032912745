//! Dual-path router.
//!
//! [`Engine::execute`] runs the capability guard, consults the result cache
//! for idempotent nodes, picks a mode (pinned or estimated), dispatches to
//! one or both backends, and feeds comparisons back into the estimator.

use crate::backend::{Backend, BackendFailure, Invocation};
use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::descriptor::{KeyPolicy, NodeDescriptor};
use crate::error::{BackendError, ConfigError, EngineError, GuardError};
use crate::guard::authorize;
use crate::hotpath::{CompilationState, HotPathCache};
use crate::registry::NodeRegistry;
use crate::result::ExecutionResult;
use crate::shadow::BackgroundPool;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use twinpath_core::{
    CapabilitySet, Difference, ExecutionMode, ExecutionPath, Fields, Fingerprinter, NodeId,
    Outcome,
};
use twinpath_log::{
    AuditSink, CompilationEvent, CompilationStatus, DivergenceRecord, DivergenceStore,
    ExecutionEvent, FallbackEvent, ObservedResult, TracingSink,
};
use twinpath_verify::{Comparator, ConfidenceEstimator, ExecutionMonitor, MetricsSnapshot};

/// Everything known about one node's routing state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMetrics {
    /// Node identifier
    pub node_id: NodeId,
    /// Estimator counters
    pub counters: MetricsSnapshot,
    /// Wilson lower bound; 0 below the sample floor
    pub score: f64,
    /// Mode the next call will use
    pub mode: ExecutionMode,
    /// Operator override, if any
    pub pinned: Option<ExecutionMode>,
    /// Hot-path compilation state
    pub hot_state: CompilationState,
    /// Optimized calls counted toward compilation
    pub hot_calls: u64,
}

struct Inner {
    config: EngineConfig,
    registry: Arc<dyn NodeRegistry>,
    reference: Arc<dyn Backend>,
    optimized: Arc<dyn Backend>,
    estimator: Arc<ConfidenceEstimator>,
    comparator: Comparator,
    cache: ResultCache,
    hot: HotPathCache,
    pool: BackgroundPool,
    sink: Arc<dyn AuditSink>,
    divergences: Arc<DivergenceStore>,
    monitor: ExecutionMonitor,
    pinned: RwLock<HashMap<NodeId, ExecutionMode>>,
    last_modes: RwLock<HashMap<NodeId, ExecutionMode>>,
}

/// Dual-path execution engine
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("reference", &self.inner.reference.name())
            .field("optimized", &self.inner.optimized.name())
            .field("pending_background", &self.inner.pool.pending())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<dyn NodeRegistry>>,
    reference: Option<Arc<dyn Backend>>,
    optimized: Option<Arc<dyn Backend>>,
    sink: Option<Arc<dyn AuditSink>>,
    estimator: Option<Arc<ConfidenceEstimator>>,
    divergences: Option<Arc<DivergenceStore>>,
}

impl EngineBuilder {
    /// Create a builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the descriptor source
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the trusted backend
    #[must_use]
    pub fn with_reference(mut self, backend: Arc<dyn Backend>) -> Self {
        self.reference = Some(backend);
        self
    }

    /// Set the fast backend
    #[must_use]
    pub fn with_optimized(mut self, backend: Arc<dyn Backend>) -> Self {
        self.optimized = Some(backend);
        self
    }

    /// Set the audit sink; defaults to [`TracingSink`]
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Reuse an existing estimator, e.g. one restored from exported state
    #[must_use]
    pub fn with_estimator(mut self, estimator: Arc<ConfidenceEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Reuse an existing divergence history
    #[must_use]
    pub fn with_divergence_store(mut self, store: Arc<DivergenceStore>) -> Self {
        self.divergences = Some(store);
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a component is missing
    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        let registry = self.registry.ok_or(ConfigError::Missing("registry"))?;
        let reference = self.reference.ok_or(ConfigError::Missing("reference backend"))?;
        let optimized = self.optimized.ok_or(ConfigError::Missing("optimized backend"))?;
        let config = self.config;

        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(ConfidenceEstimator::new(config.confidence.clone())));
        let divergences = self
            .divergences
            .unwrap_or_else(|| Arc::new(DivergenceStore::new(config.audit.divergence_history)));
        let pinned = config
            .routing
            .pinned
            .iter()
            .map(|(id, mode)| (id.clone(), *mode))
            .collect();

        info!(
            reference = reference.name(),
            optimized = optimized.name(),
            min_sample_size = estimator.config().min_sample_size,
            "engine ready"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                comparator: Comparator::new(config.compare.clone()),
                cache: ResultCache::new(),
                hot: HotPathCache::new(config.hot_path.threshold),
                pool: BackgroundPool::new(config.shadow.max_in_flight),
                sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
                monitor: ExecutionMonitor::default(),
                pinned: RwLock::new(pinned),
                last_modes: RwLock::new(HashMap::new()),
                config,
                registry,
                reference,
                optimized,
                estimator,
                divergences,
            }),
        })
    }
}

impl Engine {
    /// Start building an engine
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Execute a node
    ///
    /// # Errors
    ///
    /// Returns error if the node is unknown, the caller lacks a capability,
    /// a required idempotency key is missing, the reference backend fails,
    /// or the request deadline passes
    #[tracing::instrument(
        name = "execute",
        skip(self, node_id, inputs, idempotency_key, granted),
        fields(node = %node_id, mode = tracing::field::Empty)
    )]
    pub async fn execute(
        &self,
        node_id: &NodeId,
        inputs: Fields,
        idempotency_key: Option<&str>,
        granted: &CapabilitySet,
    ) -> Result<ExecutionResult, EngineError> {
        let request = self.execute_unbounded(node_id, inputs, idempotency_key, granted);
        match self.inner.config.request_timeout_ms {
            Some(timeout_ms) => tokio::time::timeout(Duration::from_millis(timeout_ms), request)
                .await
                .unwrap_or_else(|_| {
                    warn!(node = %node_id, timeout_ms, "request timed out");
                    Err(EngineError::Timeout {
                        node_id: node_id.clone(),
                        timeout_ms,
                    })
                }),
            None => request.await,
        }
    }

    async fn execute_unbounded(
        &self,
        node_id: &NodeId,
        inputs: Fields,
        idempotency_key: Option<&str>,
        granted: &CapabilitySet,
    ) -> Result<ExecutionResult, EngineError> {
        let descriptor = self
            .inner
            .registry
            .lookup(node_id)
            .ok_or_else(|| EngineError::UnknownNode {
                node_id: node_id.clone(),
            })?;

        authorize(&descriptor, granted).map_err(|err| match err {
            GuardError::MissingCapability { capability } => EngineError::MissingCapability {
                node_id: node_id.clone(),
                capability,
            },
        })?;

        if descriptor.key_policy == KeyPolicy::Required && idempotency_key.is_none() {
            return Err(EngineError::MissingIdempotencyKey {
                node_id: node_id.clone(),
            });
        }

        let invocation = Invocation::new(descriptor.clone(), Arc::new(inputs))
            .with_idempotency_key(idempotency_key.map(str::to_string));

        if !descriptor.idempotent {
            return self.dispatch(invocation).await;
        }

        let fingerprint = Fingerprinter::new()
            .node(&descriptor.id)
            .version(&descriptor.version)
            .fields(&invocation.inputs)
            .key(descriptor.key_policy.fold(idempotency_key))
            .finish();

        let (result, hit) = self
            .inner
            .cache
            .get_or_compute(&descriptor.id, fingerprint, || self.dispatch(invocation))
            .await?;
        if hit {
            debug!(node = %descriptor.id, %fingerprint, "cache hit");
            self.inner.monitor.record_cache_hit(&descriptor.id);
            self.emit_execution(&descriptor, &result, true);
        }
        Ok(result)
    }

    async fn dispatch(&self, invocation: Invocation) -> Result<ExecutionResult, EngineError> {
        let descriptor = invocation.descriptor.clone();
        let mode = self.mode_for(&descriptor.id);
        tracing::Span::current().record("mode", mode.as_str());

        let result = match mode {
            ExecutionMode::ReferenceOnly => self.run_reference(&invocation, mode).await?,
            ExecutionMode::Shadow => {
                let result = self.run_reference(&invocation, mode).await?;
                self.spawn_shadow(invocation, result.outcome.clone(), mode);
                result
            }
            ExecutionMode::Canary => {
                let canary = self.in_canary(&invocation);
                debug!(node = %descriptor.id, canary, "canary partition");
                if canary {
                    let result = self.run_optimized(&invocation, mode).await?;
                    // Optimized canary answers count as clean samples; fallbacks do not
                    if result.path == ExecutionPath::Optimized {
                        self.inner.estimator.record_outcome(&descriptor.id, false);
                    }
                    result
                } else {
                    self.run_reference(&invocation, mode).await?
                }
            }
            ExecutionMode::DualVerify => {
                self.run_dual(&invocation, mode, ExecutionPath::Reference)
                    .await?
            }
            ExecutionMode::OptimizedOnly => {
                if self.sample_optimized() {
                    self.run_dual(&invocation, mode, ExecutionPath::Optimized)
                        .await?
                } else {
                    self.run_optimized(&invocation, mode).await?
                }
            }
        };

        self.emit_execution(&descriptor, &result, false);
        Ok(result)
    }

    fn mode_for(&self, node_id: &NodeId) -> ExecutionMode {
        if let Some(mode) = self.inner.pinned.read().get(node_id) {
            return *mode;
        }
        let mode = self.inner.estimator.current_mode(node_id);
        if self.inner.last_modes.read().get(node_id) == Some(&mode) {
            return mode;
        }
        let previous = self.inner.last_modes.write().insert(node_id.clone(), mode);
        match previous {
            Some(previous) if previous != mode => {
                info!(node = %node_id, from = %previous, to = %mode, "mode changed");
            }
            Some(_) => {}
            None => debug!(node = %node_id, %mode, "initial mode"),
        }
        mode
    }

    fn in_canary(&self, invocation: &Invocation) -> bool {
        let bucket = Fingerprinter::new()
            .node(invocation.node_id())
            .fields(&invocation.inputs)
            .finish()
            .bucket(100);
        bucket < u64::from(self.inner.config.routing.canary_percent)
    }

    fn sample_optimized(&self) -> bool {
        rand::thread_rng().gen_bool(self.inner.config.routing.optimized_sample_rate)
    }

    async fn call_reference(&self, invocation: &Invocation) -> Result<Outcome, BackendFailure> {
        let start = Instant::now();
        let outcome = self.inner.reference.invoke(invocation).await;
        self.inner.monitor.record_execution(
            invocation.node_id(),
            ExecutionPath::Reference,
            start.elapsed(),
            outcome.as_ref().is_ok_and(Outcome::is_success),
        );
        if let Err(failure) = &outcome {
            warn!(node = %invocation.node_id(), %failure, "reference backend failed");
            self.inner
                .estimator
                .record_reference_error(invocation.node_id());
        }
        outcome
    }

    async fn call_optimized(&self, invocation: &Invocation) -> Result<Outcome, BackendFailure> {
        let descriptor = &invocation.descriptor;
        let artifact = if self.inner.config.hot_path.enabled {
            self.inner.hot.get_compiled(&descriptor.id, descriptor.version)
        } else {
            None
        };
        let invocation = invocation.clone().with_artifact(artifact);

        let start = Instant::now();
        let outcome = self.inner.optimized.invoke(&invocation).await;
        self.inner.monitor.record_execution(
            &descriptor.id,
            ExecutionPath::Optimized,
            start.elapsed(),
            outcome.as_ref().is_ok_and(Outcome::is_success),
        );
        if outcome.is_err() {
            self.inner.estimator.record_optimized_error(&descriptor.id);
        }
        self.note_hot(descriptor);
        outcome
    }

    fn note_hot(&self, descriptor: &Arc<NodeDescriptor>) {
        let inner = &self.inner;
        if !inner.config.hot_path.enabled || !inner.hot.note_call(&descriptor.id, descriptor.version) {
            return;
        }
        let calls = inner.hot.call_count(&descriptor.id);
        info!(node = %descriptor.id, version = %descriptor.version, calls, "compilation requested");
        inner.sink.emit(
            CompilationEvent::new(
                descriptor.id.clone(),
                descriptor.version,
                CompilationStatus::Started { calls },
            )
            .into(),
        );

        let engine = self.clone();
        let descriptor = descriptor.clone();
        inner.pool.spawn_tracked(async move {
            let inner = &engine.inner;
            let status = match inner.optimized.compile(&descriptor).await {
                Ok(artifact) => {
                    let artifact_id = artifact.id.clone();
                    if inner
                        .hot
                        .finish_compilation(&descriptor.id, descriptor.version, artifact)
                    {
                        CompilationStatus::Succeeded {
                            artifact: artifact_id,
                        }
                    } else {
                        return;
                    }
                }
                Err(failure) => {
                    inner.hot.fail_compilation(&descriptor.id, descriptor.version);
                    CompilationStatus::Failed {
                        reason: failure.to_string(),
                    }
                }
            };
            inner.sink.emit(
                CompilationEvent::new(descriptor.id.clone(), descriptor.version, status).into(),
            );
        });
    }

    async fn run_reference(
        &self,
        invocation: &Invocation,
        mode: ExecutionMode,
    ) -> Result<ExecutionResult, EngineError> {
        let start = Instant::now();
        let outcome = self
            .call_reference(invocation)
            .await
            .map_err(BackendError::from)?;
        Ok(ExecutionResult {
            outcome,
            path: ExecutionPath::Reference,
            mode,
            elapsed: start.elapsed(),
            diverged: false,
        })
    }

    /// Optimized answers; reference covers for a failure
    async fn run_optimized(
        &self,
        invocation: &Invocation,
        mode: ExecutionMode,
    ) -> Result<ExecutionResult, EngineError> {
        let start = Instant::now();
        match self.call_optimized(invocation).await {
            Ok(outcome) => Ok(ExecutionResult {
                outcome,
                path: ExecutionPath::Optimized,
                mode,
                elapsed: start.elapsed(),
                diverged: false,
            }),
            Err(failure) => {
                self.record_fallback(&invocation.descriptor, mode, &failure);
                let mut result = self.run_reference(invocation, mode).await?;
                result.elapsed = start.elapsed();
                Ok(result)
            }
        }
    }

    /// Both run concurrently; `answer` picks whose outcome the caller gets
    async fn run_dual(
        &self,
        invocation: &Invocation,
        mode: ExecutionMode,
        answer: ExecutionPath,
    ) -> Result<ExecutionResult, EngineError> {
        let start = Instant::now();
        let (reference, optimized) = tokio::join!(
            self.call_reference(invocation),
            self.call_optimized(invocation)
        );
        let elapsed = start.elapsed();

        let (reference, optimized) = match (reference, optimized) {
            (Ok(reference), optimized) => (reference, optimized),
            (Err(_), Ok(optimized)) if answer == ExecutionPath::Optimized => {
                // Nothing to compare against; the optimized answer stands
                return Ok(ExecutionResult {
                    outcome: optimized,
                    path: ExecutionPath::Optimized,
                    mode,
                    elapsed,
                    diverged: false,
                });
            }
            (Err(failure), _) => return Err(BackendError::from(failure).into()),
        };

        let diverged = self.settle(invocation, mode, &reference, optimized.as_ref());
        let (outcome, path) = match (answer, optimized) {
            (ExecutionPath::Optimized, Ok(optimized)) => (optimized, ExecutionPath::Optimized),
            (ExecutionPath::Optimized, Err(failure)) => {
                self.record_fallback(&invocation.descriptor, mode, &failure);
                (reference, ExecutionPath::Reference)
            }
            (ExecutionPath::Reference, _) => (reference, ExecutionPath::Reference),
        };

        Ok(ExecutionResult {
            outcome,
            path,
            mode,
            elapsed,
            diverged,
        })
    }

    fn spawn_shadow(&self, invocation: Invocation, reference: Outcome, mode: ExecutionMode) {
        let engine = self.clone();
        let node_id = invocation.node_id().clone();
        let spawned = self.inner.pool.try_spawn(async move {
            let optimized = engine.call_optimized(&invocation).await;
            engine.settle(&invocation, mode, &reference, optimized.as_ref());
        });
        if !spawned {
            debug!(node = %node_id, "shadow sample dropped");
        }
    }

    /// Compare, update the estimator, and report a divergence
    fn settle(
        &self,
        invocation: &Invocation,
        mode: ExecutionMode,
        reference: &Outcome,
        optimized: Result<&Outcome, &BackendFailure>,
    ) -> bool {
        let descriptor = &invocation.descriptor;
        let (differences, observed) = match optimized {
            Ok(outcome) => (
                self.inner
                    .comparator
                    .diff(reference, outcome, &descriptor.output_shape),
                ObservedResult::Completed {
                    outcome: outcome.clone(),
                },
            ),
            Err(failure) => (
                Vec::new(),
                ObservedResult::Failed {
                    backend: failure.backend.clone(),
                    message: failure.message.clone(),
                },
            ),
        };
        let diverged = !differences.is_empty() || !observed.is_completed();
        self.inner.estimator.record_outcome(&descriptor.id, diverged);
        if diverged {
            self.report_divergence(invocation, mode, reference, observed, differences);
        }
        diverged
    }

    fn report_divergence(
        &self,
        invocation: &Invocation,
        mode: ExecutionMode,
        reference: &Outcome,
        optimized: ObservedResult,
        differences: Vec<Difference>,
    ) {
        let descriptor = &invocation.descriptor;
        warn!(
            node = %descriptor.id,
            version = %descriptor.version,
            %mode,
            differences = differences.len(),
            first = ?differences.first().map(ToString::to_string),
            optimized_completed = optimized.is_completed(),
            "divergence detected"
        );
        self.inner.monitor.record_divergence(&descriptor.id);
        let record = DivergenceRecord::new(
            descriptor.id.clone(),
            descriptor.version,
            mode,
            (*invocation.inputs).clone(),
            ObservedResult::Completed {
                outcome: reference.clone(),
            },
            optimized,
        )
        .with_differences(differences);
        self.inner.divergences.record(record.clone());
        self.inner.sink.emit(record.into());
    }

    fn record_fallback(&self, descriptor: &NodeDescriptor, mode: ExecutionMode, failure: &BackendFailure) {
        warn!(node = %descriptor.id, %mode, %failure, "optimized backend failed, falling back");
        self.inner.estimator.record_fallback(&descriptor.id);
        self.inner.monitor.record_fallback(&descriptor.id);
        self.inner.sink.emit(
            FallbackEvent::new(
                descriptor.id.clone(),
                descriptor.version,
                mode,
                failure.backend.clone(),
                failure.message.clone(),
            )
            .into(),
        );
    }

    fn emit_execution(&self, descriptor: &NodeDescriptor, result: &ExecutionResult, cached: bool) {
        if !self.inner.config.audit.log_executions {
            return;
        }
        let event = ExecutionEvent::new(
            descriptor.id.clone(),
            descriptor.version,
            result.mode,
            result.path,
            result.elapsed,
            result.outcome.is_success(),
        )
        .with_cached(cached);
        self.inner.sink.emit(event.into());
    }

    /// Mode the next call to `node_id` will use
    #[must_use]
    pub fn current_mode(&self, node_id: &NodeId) -> ExecutionMode {
        if let Some(mode) = self.inner.pinned.read().get(node_id) {
            return *mode;
        }
        self.inner.estimator.current_mode(node_id)
    }

    /// Counters, score, mode and hot-path state for a node
    #[must_use]
    pub fn metrics_snapshot(&self, node_id: &NodeId) -> NodeMetrics {
        let inner = &self.inner;
        NodeMetrics {
            node_id: node_id.clone(),
            counters: inner.estimator.snapshot(node_id),
            score: inner.estimator.score(node_id),
            mode: self.current_mode(node_id),
            pinned: inner.pinned.read().get(node_id).copied(),
            hot_state: inner.hot.state(node_id),
            hot_calls: inner.hot.call_count(node_id),
        }
    }

    /// Forget a node's confidence counters and aggregates
    pub fn reset_metrics(&self, node_id: &NodeId) {
        self.inner.estimator.reset(node_id);
        self.inner.monitor.reset(Some(node_id));
        self.inner.last_modes.write().remove(node_id);
        info!(node = %node_id, "metrics reset");
    }

    /// Force a mode for a node, overriding the estimator
    pub fn pin_mode(&self, node_id: &NodeId, mode: ExecutionMode) {
        self.inner.pinned.write().insert(node_id.clone(), mode);
        info!(node = %node_id, %mode, "mode pinned");
    }

    /// Return a node to estimated routing
    pub fn unpin_mode(&self, node_id: &NodeId) -> Option<ExecutionMode> {
        let previous = self.inner.pinned.write().remove(node_id);
        if previous.is_some() {
            info!(node = %node_id, "mode unpinned");
        }
        previous
    }

    /// Wait for every shadow comparison and compilation started so far
    pub async fn drain_background(&self) {
        self.inner.pool.drain().await;
    }

    /// Background tasks still running
    #[must_use]
    pub fn pending_background(&self) -> usize {
        self.inner.pool.pending()
    }

    /// Shadow samples dropped because the pool was full
    #[must_use]
    pub fn shadow_dropped(&self) -> u64 {
        self.inner.pool.dropped()
    }

    /// Per-node aggregates
    #[must_use]
    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.inner.monitor
    }

    /// Divergence history
    #[must_use]
    pub fn divergences(&self) -> &Arc<DivergenceStore> {
        &self.inner.divergences
    }

    /// Confidence estimator
    #[must_use]
    pub fn estimator(&self) -> &Arc<ConfidenceEstimator> {
        &self.inner.estimator
    }

    /// Result cache
    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    /// Hot-path tracking
    #[must_use]
    pub fn hot_path(&self) -> &HotPathCache {
        &self.inner.hot
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuditConfig, HotPathConfig, RoutingConfig};
    use crate::registry::InMemoryRegistry;
    use crate::testing::{CompileBehavior, FnBackend};
    use twinpath_core::{fields, DifferenceKind, Value, Version};
    use twinpath_log::{AuditEvent, MemorySink, NullSink};
    use twinpath_verify::{ConfidenceConfig, FieldKind};

    fn add_v1() -> NodeId {
        NodeId::new("add_v1").unwrap()
    }

    fn add_descriptor() -> NodeDescriptor {
        NodeDescriptor::new(add_v1(), Version::default()).with_output_field("result", FieldKind::Int)
    }

    fn sum(inv: &Invocation, offset: i64) -> Result<Outcome, BackendFailure> {
        let a = inv.inputs.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = inv.inputs.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(Outcome::success(fields! { "result" => a + b + offset }))
    }

    fn reference() -> Arc<FnBackend> {
        Arc::new(FnBackend::new("reference", |inv| sum(inv, 0)))
    }

    fn correct_optimized() -> Arc<FnBackend> {
        Arc::new(FnBackend::new("optimized", |inv| sum(inv, 0)))
    }

    fn buggy_optimized() -> Arc<FnBackend> {
        Arc::new(FnBackend::new("optimized", |inv| sum(inv, 1)))
    }

    fn failing_optimized() -> Arc<FnBackend> {
        Arc::new(FnBackend::new("optimized", |_| {
            Err(BackendFailure::new("optimized", "kernel crashed"))
        }))
    }

    struct Harness {
        engine: Engine,
        registry: Arc<InMemoryRegistry>,
        reference: Arc<FnBackend>,
        optimized: Arc<FnBackend>,
        sink: Arc<MemorySink>,
    }

    fn harness_with(
        config: EngineConfig,
        descriptor: NodeDescriptor,
        reference: Arc<FnBackend>,
        optimized: Arc<FnBackend>,
    ) -> Harness {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(descriptor).unwrap();
        let sink = Arc::new(MemorySink::new());
        let engine = Engine::builder()
            .with_config(config)
            .with_registry(registry.clone())
            .with_reference(reference.clone())
            .with_optimized(optimized.clone())
            .with_sink(sink.clone())
            .build()
            .unwrap();
        Harness {
            engine,
            registry,
            reference,
            optimized,
            sink,
        }
    }

    fn harness(optimized: Arc<FnBackend>) -> Harness {
        harness_with(EngineConfig::default(), add_descriptor(), reference(), optimized)
    }

    fn none() -> CapabilitySet {
        CapabilitySet::new()
    }

    #[tokio::test]
    async fn test_fresh_node_is_reference_only() {
        let h = harness(correct_optimized());
        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::success(fields! { "result" => 3 }));
        assert_eq!(result.path, ExecutionPath::Reference);
        assert_eq!(result.mode, ExecutionMode::ReferenceOnly);
        assert!(!result.diverged);
        assert_eq!(h.optimized.calls(), 0);
        assert_eq!(h.sink.count("execution"), 1);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let h = harness(correct_optimized());
        let err = h
            .engine
            .execute(&NodeId::new("nope").unwrap(), fields! {}, None, &none())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode { .. }));
    }

    #[tokio::test]
    async fn test_missing_capability_runs_nothing() {
        let descriptor = NodeDescriptor::new(NodeId::new("charge_card").unwrap(), Version::default())
            .with_required(CapabilitySet::parse(["payments.charge"]).unwrap());
        let h = harness_with(EngineConfig::default(), descriptor, reference(), correct_optimized());
        h.engine.pin_mode(&NodeId::new("charge_card").unwrap(), ExecutionMode::DualVerify);

        let err = h
            .engine
            .execute(&NodeId::new("charge_card").unwrap(), fields! { "amount" => 100 }, None, &none())
            .await
            .unwrap_err();
        match err {
            EngineError::MissingCapability { capability, .. } => {
                assert_eq!(capability.as_str(), "payments.charge");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.reference.calls(), 0);
        assert_eq!(h.optimized.calls(), 0);
        assert!(h.sink.is_empty());

        let granted = CapabilitySet::parse(["payments.*"]).unwrap();
        assert!(h
            .engine
            .execute(&NodeId::new("charge_card").unwrap(), fields! { "amount" => 100 }, None, &granted)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_dual_verify_matching_results() {
        let h = harness(correct_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::DualVerify);

        for i in 0..10 {
            let result = h
                .engine
                .execute(&add_v1(), fields! { "a" => i, "b" => 1 }, None, &none())
                .await
                .unwrap();
            assert_eq!(result.path, ExecutionPath::Reference);
            assert!(!result.diverged);
        }

        let metrics = h.engine.metrics_snapshot(&add_v1());
        assert_eq!(metrics.counters.total, 10);
        assert_eq!(metrics.counters.divergences, 0);
        assert_eq!(metrics.pinned, Some(ExecutionMode::DualVerify));
        assert_eq!(h.reference.calls(), 10);
        assert_eq!(h.optimized.calls(), 10);
        assert_eq!(h.sink.count("divergence"), 0);
    }

    #[tokio::test]
    async fn test_dual_verify_divergence_returns_reference() {
        let h = harness(buggy_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::DualVerify);

        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::success(fields! { "result" => 3 }));
        assert!(result.diverged);

        let counters = h.engine.metrics_snapshot(&add_v1()).counters;
        assert_eq!(counters.total, 1);
        assert_eq!(counters.divergences, 1);

        assert_eq!(h.sink.count("divergence"), 1);
        let records = h.engine.divergences().for_node(&add_v1(), 10, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].differences.len(), 1);
        assert_eq!(records[0].differences[0].path, "root.result");
        assert_eq!(records[0].differences[0].kind, DifferenceKind::NumericMismatch);
        assert_eq!(records[0].inputs, fields! { "a" => 1, "b" => 2 });
    }

    #[tokio::test]
    async fn test_dual_verify_optimized_failure_is_divergence() {
        let h = harness(failing_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::DualVerify);

        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();
        assert_eq!(result.outcome, Outcome::success(fields! { "result" => 3 }));
        assert!(result.diverged);

        let counters = h.engine.metrics_snapshot(&add_v1()).counters;
        assert_eq!(counters.divergences, 1);
        assert_eq!(counters.optimized_errors, 1);
        match &h.engine.divergences().for_node(&add_v1(), 1, 0)[0].optimized {
            ObservedResult::Failed { message, .. } => assert_eq!(message, "kernel crashed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reference_failure_surfaces() {
        let failing_reference = Arc::new(FnBackend::new("reference", |_| {
            Err(BackendFailure::retryable("reference", "connection reset"))
        }));
        let h = harness_with(
            EngineConfig::default(),
            add_descriptor(),
            failing_reference,
            correct_optimized(),
        );
        h.engine.pin_mode(&add_v1(), ExecutionMode::DualVerify);

        let err = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1 }, None, &none())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let counters = h.engine.metrics_snapshot(&add_v1()).counters;
        assert_eq!(counters.reference_errors, 1);
        assert_eq!(counters.total, 0);
    }

    #[tokio::test]
    async fn test_error_outcomes_are_compared_by_code() {
        let reference = Arc::new(FnBackend::new("reference", |_| {
            Ok(Outcome::error("E_OVERFLOW", "sum overflowed"))
        }));
        let optimized = Arc::new(FnBackend::new("optimized", |_| {
            Ok(Outcome::error("E_OVERFLOW", "overflow in lane 3"))
        }));
        let h = harness_with(EngineConfig::default(), add_descriptor(), reference, optimized);
        h.engine.pin_mode(&add_v1(), ExecutionMode::DualVerify);

        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => i64::MAX, "b" => 1 }, None, &none())
            .await
            .unwrap();
        assert!(!result.is_success());
        assert!(!result.diverged);
    }

    #[tokio::test]
    async fn test_idempotent_cache_hit_skips_metrics() {
        let descriptor = add_descriptor().with_idempotent(true);
        let h = harness_with(EngineConfig::default(), descriptor, reference(), correct_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::DualVerify);

        let first = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();
        let before = h.engine.metrics_snapshot(&add_v1()).counters;

        let second = h
            .engine
            .execute(&add_v1(), fields! { "b" => 2, "a" => 1 }, None, &none())
            .await
            .unwrap();
        let after = h.engine.metrics_snapshot(&add_v1()).counters;

        assert_eq!(first, second);
        assert_eq!(before.total, 1);
        assert_eq!(after.total, before.total);
        assert_eq!(after.divergences, before.divergences);
        assert_eq!(h.reference.calls(), 1);
        assert_eq!(h.optimized.calls(), 1);
        assert_eq!(h.engine.monitor().aggregate(&add_v1()).cache_hits, 1);

        let cached: Vec<_> = h
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::Execution(x) if x.cached))
            .collect();
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn test_error_outcomes_not_cached() {
        let reference = Arc::new(FnBackend::new("reference", |_| {
            Ok(Outcome::error("E_UNAVAILABLE", "try later"))
        }));
        let descriptor = add_descriptor().with_idempotent(true);
        let h = harness_with(EngineConfig::default(), descriptor, reference, correct_optimized());

        for _ in 0..2 {
            h.engine
                .execute(&add_v1(), fields! { "a" => 1 }, None, &none())
                .await
                .unwrap();
        }
        assert_eq!(h.reference.calls(), 2);
        assert!(h.engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_key_policies() {
        let required = add_descriptor()
            .with_idempotent(true)
            .with_key_policy(KeyPolicy::Required);
        let h = harness_with(EngineConfig::default(), required, reference(), correct_optimized());
        let err = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1 }, None, &none())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingIdempotencyKey { .. }));
        assert_eq!(h.reference.calls(), 0);

        h.engine
            .execute(&add_v1(), fields! { "a" => 1 }, Some("req-1"), &none())
            .await
            .unwrap();
        h.engine
            .execute(&add_v1(), fields! { "a" => 1 }, Some("req-2"), &none())
            .await
            .unwrap();
        h.engine
            .execute(&add_v1(), fields! { "a" => 1 }, Some("req-1"), &none())
            .await
            .unwrap();
        assert_eq!(h.reference.calls(), 2);

        let ignored = add_descriptor()
            .with_idempotent(true)
            .with_key_policy(KeyPolicy::Ignored);
        let h = harness_with(EngineConfig::default(), ignored, reference(), correct_optimized());
        h.engine
            .execute(&add_v1(), fields! { "a" => 1 }, Some("req-1"), &none())
            .await
            .unwrap();
        h.engine
            .execute(&add_v1(), fields! { "a" => 1 }, Some("req-2"), &none())
            .await
            .unwrap();
        assert_eq!(h.reference.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_requests_single_flight() {
        let slow = Arc::new(
            FnBackend::new("reference", |inv| sum(inv, 0)).with_delay(Duration::from_millis(50)),
        );
        let descriptor = add_descriptor().with_idempotent(true);
        let h = harness_with(EngineConfig::default(), descriptor, slow, correct_optimized());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = h.engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .execute(&add_v1(), fields! { "a" => 4, "b" => 5 }, None, &CapabilitySet::new())
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.outcome, Outcome::success(fields! { "result" => 9 }));
        }
        assert_eq!(h.reference.calls(), 1);
    }

    #[tokio::test]
    async fn test_canary_partition_is_stable_and_proportional() {
        let config = EngineConfig::default()
            .with_hot_path(HotPathConfig {
                enabled: false,
                ..HotPathConfig::default()
            })
            .with_audit(AuditConfig {
                log_executions: false,
                ..AuditConfig::default()
            });
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(add_descriptor()).unwrap();
        let optimized = correct_optimized();
        let engine = Engine::builder()
            .with_config(config)
            .with_registry(registry)
            .with_reference(reference())
            .with_optimized(optimized.clone())
            .with_sink(Arc::new(NullSink))
            .build()
            .unwrap();
        engine.pin_mode(&add_v1(), ExecutionMode::Canary);

        let n = 100_000;
        let mut optimized_paths = 0;
        for i in 0..n {
            let result = engine
                .execute(&add_v1(), fields! { "a" => i, "b" => 0 }, None, &none())
                .await
                .unwrap();
            if result.path == ExecutionPath::Optimized {
                optimized_paths += 1;
            }
        }
        let share = f64::from(optimized_paths) / f64::from(n);
        assert!((share - 0.05).abs() <= 0.01, "canary share {share}");
        assert_eq!(optimized.calls(), u64::try_from(optimized_paths).unwrap());
        // Only optimized answers count toward confidence
        assert_eq!(
            engine.metrics_snapshot(&add_v1()).counters.total,
            u64::try_from(optimized_paths).unwrap()
        );

        // Same inputs always land on the same side
        let first = engine
            .execute(&add_v1(), fields! { "a" => 17, "b" => 0 }, None, &none())
            .await
            .unwrap();
        for _ in 0..5 {
            let again = engine
                .execute(&add_v1(), fields! { "a" => 17, "b" => 0 }, None, &none())
                .await
                .unwrap();
            assert_eq!(again.path, first.path);
        }
    }

    #[tokio::test]
    async fn test_canary_fallback_on_optimized_failure() {
        let config = EngineConfig::default().with_routing(RoutingConfig {
            canary_percent: 100,
            ..RoutingConfig::default()
        });
        let h = harness_with(config, add_descriptor(), reference(), failing_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::Canary);

        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();
        assert_eq!(result.path, ExecutionPath::Reference);
        assert_eq!(result.outcome, Outcome::success(fields! { "result" => 3 }));
        assert!(!result.diverged);

        let counters = h.engine.metrics_snapshot(&add_v1()).counters;
        assert_eq!(counters.fallbacks, 1);
        assert_eq!(counters.optimized_errors, 1);
        assert_eq!(counters.divergences, 0);
        assert_eq!(counters.total, 0);
        assert_eq!(h.sink.count("fallback"), 1);
    }

    #[tokio::test]
    async fn test_shadow_does_not_wait_for_optimized() {
        let slow = Arc::new(
            FnBackend::new("optimized", |inv| sum(inv, 1)).with_delay(Duration::from_millis(300)),
        );
        let h = harness(slow);
        h.engine.pin_mode(&add_v1(), ExecutionMode::Shadow);

        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();
        assert_eq!(result.path, ExecutionPath::Reference);
        assert!(!result.diverged);
        assert_eq!(h.engine.metrics_snapshot(&add_v1()).counters.total, 0);
        assert_eq!(h.engine.pending_background(), 1);

        h.engine.drain_background().await;
        let counters = h.engine.metrics_snapshot(&add_v1()).counters;
        assert_eq!(counters.total, 1);
        assert_eq!(counters.divergences, 1);
        assert_eq!(h.sink.count("divergence"), 1);
    }

    #[tokio::test]
    async fn test_optimized_only_sampled_returns_optimized() {
        let config = EngineConfig::default().with_routing(RoutingConfig {
            optimized_sample_rate: 1.0,
            ..RoutingConfig::default()
        });
        let h = harness_with(config, add_descriptor(), reference(), buggy_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::OptimizedOnly);

        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();
        assert_eq!(result.path, ExecutionPath::Optimized);
        assert_eq!(result.outcome, Outcome::success(fields! { "result" => 4 }));
        assert!(result.diverged);
        assert_eq!(h.reference.calls(), 1);
        assert_eq!(h.sink.count("divergence"), 1);
    }

    #[tokio::test]
    async fn test_optimized_only_unsampled_skips_reference() {
        let config = EngineConfig::default().with_routing(RoutingConfig {
            optimized_sample_rate: 0.0,
            ..RoutingConfig::default()
        });
        let h = harness_with(config, add_descriptor(), reference(), correct_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::OptimizedOnly);

        for i in 0..20 {
            let result = h
                .engine
                .execute(&add_v1(), fields! { "a" => i }, None, &none())
                .await
                .unwrap();
            assert_eq!(result.path, ExecutionPath::Optimized);
        }
        assert_eq!(h.reference.calls(), 0);
        assert_eq!(h.engine.metrics_snapshot(&add_v1()).counters.total, 0);
    }

    #[tokio::test]
    async fn test_optimized_only_failure_falls_back() {
        let config = EngineConfig::default().with_routing(RoutingConfig {
            optimized_sample_rate: 1.0,
            ..RoutingConfig::default()
        });
        let h = harness_with(config, add_descriptor(), reference(), failing_optimized());
        h.engine.pin_mode(&add_v1(), ExecutionMode::OptimizedOnly);

        let result = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1, "b" => 2 }, None, &none())
            .await
            .unwrap();
        assert_eq!(result.path, ExecutionPath::Reference);
        assert_eq!(result.outcome, Outcome::success(fields! { "result" => 3 }));
        assert!(result.diverged);

        let counters = h.engine.metrics_snapshot(&add_v1()).counters;
        assert_eq!(counters.divergences, 1);
        assert_eq!(counters.fallbacks, 1);
    }

    #[tokio::test]
    async fn test_mode_follows_estimator() {
        let config = EngineConfig::default()
            .with_confidence(ConfidenceConfig::default().with_min_sample_size(1000));
        let h = harness_with(config, add_descriptor(), reference(), correct_optimized());
        let estimator = h.engine.estimator();

        for _ in 0..999 {
            estimator.record_outcome(&add_v1(), false);
        }
        assert_eq!(h.engine.current_mode(&add_v1()), ExecutionMode::ReferenceOnly);
        assert_eq!(h.engine.metrics_snapshot(&add_v1()).score, 0.0);

        // 1000 clean comparisons at z = 3.29 bound to ~0.9893: canary band
        estimator.record_outcome(&add_v1(), false);
        assert_eq!(h.engine.current_mode(&add_v1()), ExecutionMode::Canary);

        for _ in 0..100 {
            estimator.record_outcome(&add_v1(), true);
        }
        assert_eq!(h.engine.current_mode(&add_v1()), ExecutionMode::ReferenceOnly);

        h.engine.pin_mode(&add_v1(), ExecutionMode::Shadow);
        assert_eq!(h.engine.current_mode(&add_v1()), ExecutionMode::Shadow);
        assert_eq!(h.engine.unpin_mode(&add_v1()), Some(ExecutionMode::Shadow));

        h.engine.reset_metrics(&add_v1());
        assert_eq!(h.engine.metrics_snapshot(&add_v1()).counters.total, 0);
    }

    #[tokio::test]
    async fn test_clean_traffic_promotes_through_bands() {
        // z = 1 puts the band edges at 19, 999 and 9,999 clean samples
        let config = EngineConfig::default()
            .with_confidence(ConfidenceConfig::default().with_min_sample_size(10).with_z(1.0))
            .with_routing(RoutingConfig {
                canary_percent: 50,
                ..RoutingConfig::default()
            })
            .with_hot_path(HotPathConfig {
                enabled: false,
                ..HotPathConfig::default()
            })
            .with_audit(AuditConfig {
                log_executions: false,
                ..AuditConfig::default()
            });
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(add_descriptor()).unwrap();
        let engine = Engine::builder()
            .with_config(config)
            .with_registry(registry)
            .with_reference(reference())
            .with_optimized(correct_optimized())
            .with_sink(Arc::new(NullSink))
            .build()
            .unwrap();

        engine.pin_mode(&add_v1(), ExecutionMode::Shadow);
        for i in 0..20 {
            let result = engine
                .execute(&add_v1(), fields! { "a" => i, "b" => 1 }, None, &none())
                .await
                .unwrap();
            assert_eq!(result.mode, ExecutionMode::Shadow);
        }
        engine.drain_background().await;
        assert_eq!(engine.metrics_snapshot(&add_v1()).counters.total, 20);

        engine.unpin_mode(&add_v1());
        let mut modes = vec![ExecutionMode::Shadow];
        for i in 20..30_000 {
            let result = engine
                .execute(&add_v1(), fields! { "a" => i, "b" => 1 }, None, &none())
                .await
                .unwrap();
            assert!(!result.diverged);
            if modes.last() != Some(&result.mode) {
                modes.push(result.mode);
            }
            if result.mode == ExecutionMode::OptimizedOnly {
                break;
            }
        }

        assert_eq!(
            modes,
            vec![
                ExecutionMode::Shadow,
                ExecutionMode::Canary,
                ExecutionMode::DualVerify,
                ExecutionMode::OptimizedOnly,
            ]
        );
        let counters = engine.metrics_snapshot(&add_v1()).counters;
        assert_eq!(counters.divergences, 0);
        assert!(counters.total >= 9_999);
    }

    #[tokio::test]
    async fn test_hot_path_compiles_once() {
        let config = EngineConfig::default()
            .with_hot_path(HotPathConfig {
                enabled: true,
                threshold: 5,
            })
            .with_routing(RoutingConfig {
                optimized_sample_rate: 0.0,
                ..RoutingConfig::default()
            });
        let optimized = Arc::new(
            FnBackend::new("optimized", |inv| sum(inv, 0))
                .with_compile(CompileBehavior::Succeed)
                .with_compile_delay(Duration::from_millis(20)),
        );
        let h = harness_with(config, add_descriptor(), reference(), optimized);
        h.engine.pin_mode(&add_v1(), ExecutionMode::OptimizedOnly);

        for i in 0..5 {
            h.engine
                .execute(&add_v1(), fields! { "a" => i }, None, &none())
                .await
                .unwrap();
        }
        assert_eq!(h.engine.hot_path().state(&add_v1()), CompilationState::Compiling);
        h.engine.drain_background().await;
        assert_eq!(h.optimized.compiles(), 1);
        assert_eq!(h.engine.hot_path().state(&add_v1()), CompilationState::Compiled);

        for i in 5..10 {
            h.engine
                .execute(&add_v1(), fields! { "a" => i }, None, &none())
                .await
                .unwrap();
        }
        h.engine.drain_background().await;
        assert_eq!(h.optimized.compiled_calls(), 5);
        assert_eq!(h.optimized.compiles(), 1);
        assert_eq!(h.sink.count("compilation"), 2);
    }

    #[tokio::test]
    async fn test_compile_failure_stays_interpreted() {
        let config = EngineConfig::default()
            .with_hot_path(HotPathConfig {
                enabled: true,
                threshold: 3,
            })
            .with_routing(RoutingConfig {
                optimized_sample_rate: 0.0,
                ..RoutingConfig::default()
            });
        let optimized = Arc::new(
            FnBackend::new("optimized", |inv| sum(inv, 0))
                .with_compile(CompileBehavior::Fail("unsupported opcode".to_string())),
        );
        let h = harness_with(config, add_descriptor(), reference(), optimized);
        h.engine.pin_mode(&add_v1(), ExecutionMode::OptimizedOnly);

        for i in 0..3 {
            h.engine
                .execute(&add_v1(), fields! { "a" => i }, None, &none())
                .await
                .unwrap();
        }
        h.engine.drain_background().await;
        assert_eq!(h.optimized.compiles(), 1);
        assert_eq!(h.engine.hot_path().state(&add_v1()), CompilationState::Interpreted);
        assert_eq!(h.engine.hot_path().call_count(&add_v1()), 0);

        let failed = h.sink.events().into_iter().any(|e| {
            matches!(e, AuditEvent::Compilation(c) if matches!(c.status, CompilationStatus::Failed { .. }))
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn test_version_bump_resets_hot_path_and_cache() {
        let config = EngineConfig::default()
            .with_hot_path(HotPathConfig {
                enabled: true,
                threshold: 2,
            })
            .with_routing(RoutingConfig {
                optimized_sample_rate: 0.0,
                ..RoutingConfig::default()
            });
        let optimized = Arc::new(
            FnBackend::new("optimized", |inv| sum(inv, 0)).with_compile(CompileBehavior::Succeed),
        );
        let descriptor = add_descriptor().with_idempotent(true);
        let h = harness_with(config, descriptor.clone(), reference(), optimized);
        h.engine.pin_mode(&add_v1(), ExecutionMode::OptimizedOnly);

        for i in 0..2 {
            h.engine
                .execute(&add_v1(), fields! { "a" => i }, None, &none())
                .await
                .unwrap();
        }
        h.engine.drain_background().await;
        assert_eq!(h.engine.hot_path().state(&add_v1()), CompilationState::Compiled);

        let mut bumped = descriptor;
        bumped.version = Version::new(1, 1, 0);
        h.registry.replace(bumped).unwrap();

        h.engine
            .execute(&add_v1(), fields! { "a" => 0 }, None, &none())
            .await
            .unwrap();
        assert_eq!(h.engine.hot_path().state(&add_v1()), CompilationState::Interpreted);
        assert_eq!(h.engine.hot_path().call_count(&add_v1()), 1);
        // Same inputs under the new version are recomputed, not served from cache
        assert_eq!(h.optimized.calls(), 3);
        assert_eq!(h.optimized.compiled_calls(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let slow = Arc::new(
            FnBackend::new("reference", |inv| sum(inv, 0)).with_delay(Duration::from_millis(500)),
        );
        let config = EngineConfig::default().with_request_timeout_ms(50);
        let h = harness_with(config, add_descriptor(), slow, correct_optimized());

        let err = h
            .engine
            .execute(&add_v1(), fields! { "a" => 1 }, None, &none())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 50, .. }));
    }

    #[test]
    fn test_builder_requires_backends() {
        let err = Engine::builder()
            .with_registry(Arc::new(InMemoryRegistry::new()))
            .with_reference(reference())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("optimized backend")));

        let mut config = EngineConfig::default();
        config.routing.canary_percent = 150;
        let err = Engine::builder().with_config(config).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}

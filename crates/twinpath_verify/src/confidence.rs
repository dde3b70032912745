//! Confidence estimation for the optimized backend.
//!
//! Per-node counters feed a Wilson score lower bound on the rate of
//! non-divergent executions. The bound is mapped onto an [`ExecutionMode`]
//! through a fixed band table. Nothing is cached: every query recomputes
//! from the live counters, so a fresh divergence demotes immediately.

use crate::error::{VerifyError, VerifyResult};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::debug;
use twinpath_core::{ExecutionMode, NodeId};

/// Default z-score (99.9% two-sided)
pub const DEFAULT_Z: f64 = 3.29;

/// Default number of comparisons required before any promotion
pub const DEFAULT_MIN_SAMPLE_SIZE: u64 = 10_000;

/// Wilson score lower bound on the success proportion
///
/// `total` comparisons of which `divergences` failed. Returns 0 when there
/// are no observations.
#[must_use]
pub fn wilson_lower_bound(total: u64, divergences: u64, z: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    let successes = total.saturating_sub(divergences) as f64;
    let p = successes / n;
    let z2 = z * z;

    let denominator = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denominator;
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denominator;

    (center - margin).max(0.0)
}

/// Lower edges of the promoted bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    /// Scores at or above this route a slice of traffic to optimized
    pub canary: f64,
    /// Scores at or above this verify every call on both backends
    pub dual_verify: f64,
    /// Scores at or above this let optimized answer
    pub optimized_only: f64,
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self {
            canary: 0.95,
            dual_verify: 0.999,
            optimized_only: 0.9999,
        }
    }
}

impl ModeThresholds {
    /// Map a score onto a mode; never yields [`ExecutionMode::Shadow`]
    #[must_use]
    pub fn mode_for(&self, score: f64) -> ExecutionMode {
        if score >= self.optimized_only {
            ExecutionMode::OptimizedOnly
        } else if score >= self.dual_verify {
            ExecutionMode::DualVerify
        } else if score >= self.canary {
            ExecutionMode::Canary
        } else {
            ExecutionMode::ReferenceOnly
        }
    }

    /// Check the bands are strictly ascending inside (0, 1]
    ///
    /// # Errors
    ///
    /// Returns error describing the first violated bound
    pub fn validate(&self) -> VerifyResult<()> {
        let in_range = |v: f64| v > 0.0 && v <= 1.0;
        if !in_range(self.canary) || !in_range(self.dual_verify) || !in_range(self.optimized_only) {
            return Err(VerifyError::invalid("thresholds", "every threshold must be in (0, 1]"));
        }
        if !(self.canary < self.dual_verify && self.dual_verify < self.optimized_only) {
            return Err(VerifyError::invalid(
                "thresholds",
                format!(
                    "must ascend: canary {} < dual_verify {} < optimized_only {}",
                    self.canary, self.dual_verify, self.optimized_only
                ),
            ));
        }
        Ok(())
    }
}

/// Estimator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Below this many comparisons the mode is always reference-only
    pub min_sample_size: u64,
    /// z-score of the Wilson interval
    pub z: f64,
    /// Band table
    pub thresholds: ModeThresholds,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            z: DEFAULT_Z,
            thresholds: ModeThresholds::default(),
        }
    }
}

impl ConfidenceConfig {
    /// Set the sample floor
    #[must_use]
    pub fn with_min_sample_size(mut self, min: u64) -> Self {
        self.min_sample_size = min;
        self
    }

    /// Set the z-score
    #[must_use]
    pub fn with_z(mut self, z: f64) -> Self {
        self.z = z;
        self
    }

    /// Set the band table
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: ModeThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Validate settings
    ///
    /// # Errors
    ///
    /// Returns error if z is not positive and finite or the bands are invalid
    pub fn validate(&self) -> VerifyResult<()> {
        if !(self.z.is_finite() && self.z > 0.0) {
            return Err(VerifyError::invalid("z", format!("must be positive, got {}", self.z)));
        }
        self.thresholds.validate()
    }
}

/// Live counters for one node
///
/// `total` is always incremented before `divergences` and read after it,
/// so a reader never observes more divergences than comparisons.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    total: AtomicU64,
    divergences: AtomicU64,
    reference_errors: AtomicU64,
    optimized_errors: AtomicU64,
    fallbacks: AtomicU64,
    last_updated_ms: AtomicI64,
}

impl RuntimeMetrics {
    fn from_snapshot(s: &MetricsSnapshot) -> Self {
        Self {
            total: AtomicU64::new(s.total),
            divergences: AtomicU64::new(s.divergences.min(s.total)),
            reference_errors: AtomicU64::new(s.reference_errors),
            optimized_errors: AtomicU64::new(s.optimized_errors),
            fallbacks: AtomicU64::new(s.fallbacks),
            last_updated_ms: AtomicI64::new(s.last_updated.map_or(0, |t| t.timestamp_millis())),
        }
    }

    fn touch(&self) {
        self.last_updated_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_outcome(&self, diverged: bool) {
        self.total.fetch_add(1, Ordering::SeqCst);
        if diverged {
            self.divergences.fetch_add(1, Ordering::SeqCst);
        }
        self.touch();
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let divergences = self.divergences.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let last = self.last_updated_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            total,
            divergences,
            reference_errors: self.reference_errors.load(Ordering::Relaxed),
            optimized_errors: self.optimized_errors.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            last_updated: if last == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last).single()
            },
        }
    }
}

/// Point-in-time copy of a node's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSnapshot {
    /// Comparisons recorded
    pub total: u64,
    /// Comparisons that diverged
    pub divergences: u64,
    /// Reference backend failures
    pub reference_errors: u64,
    /// Optimized backend failures
    pub optimized_errors: u64,
    /// Optimized answers replaced by reference
    pub fallbacks: u64,
    /// Time of the last update
    pub last_updated: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    /// Fraction of comparisons that diverged
    #[must_use]
    pub fn divergence_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.divergences as f64 / self.total as f64
    }
}

/// Serializable estimator state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatorState {
    /// Counters per node
    pub nodes: BTreeMap<NodeId, MetricsSnapshot>,
}

/// Per-node confidence estimator
///
/// Entries are created on first reference and only removed by
/// [`ConfidenceEstimator::reset`]. The map lock is held for lookup and
/// insert only; counter updates are lock-free.
#[derive(Debug, Default)]
pub struct ConfidenceEstimator {
    config: ConfidenceConfig,
    nodes: RwLock<HashMap<NodeId, Arc<RuntimeMetrics>>>,
}

impl ConfidenceEstimator {
    /// Create an estimator
    #[must_use]
    pub fn new(config: ConfidenceConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Settings in use
    #[must_use]
    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    fn entry(&self, node_id: &NodeId) -> Arc<RuntimeMetrics> {
        if let Some(metrics) = self.nodes.read().get(node_id) {
            return metrics.clone();
        }
        self.nodes
            .write()
            .entry(node_id.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, node_id: &NodeId) -> Option<Arc<RuntimeMetrics>> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Count one comparison
    pub fn record_outcome(&self, node_id: &NodeId, diverged: bool) {
        self.entry(node_id).record_outcome(diverged);
    }

    /// Count a reference backend failure
    pub fn record_reference_error(&self, node_id: &NodeId) {
        let m = self.entry(node_id);
        m.reference_errors.fetch_add(1, Ordering::Relaxed);
        m.touch();
    }

    /// Count an optimized backend failure
    pub fn record_optimized_error(&self, node_id: &NodeId) {
        let m = self.entry(node_id);
        m.optimized_errors.fetch_add(1, Ordering::Relaxed);
        m.touch();
    }

    /// Count a fallback from optimized to reference
    pub fn record_fallback(&self, node_id: &NodeId) {
        let m = self.entry(node_id);
        m.fallbacks.fetch_add(1, Ordering::Relaxed);
        m.touch();
    }

    /// Counters for a node; zeros if never seen
    #[must_use]
    pub fn snapshot(&self, node_id: &NodeId) -> MetricsSnapshot {
        self.existing(node_id)
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    /// Wilson lower bound for a node; 0 below the sample floor
    #[must_use]
    pub fn score(&self, node_id: &NodeId) -> f64 {
        let snapshot = self.snapshot(node_id);
        if snapshot.total < self.config.min_sample_size {
            return 0.0;
        }
        wilson_lower_bound(snapshot.total, snapshot.divergences, self.config.z)
    }

    /// Mode derived from the current counters
    #[must_use]
    pub fn current_mode(&self, node_id: &NodeId) -> ExecutionMode {
        let snapshot = self.snapshot(node_id);
        if snapshot.total < self.config.min_sample_size {
            return ExecutionMode::ReferenceOnly;
        }
        let score = wilson_lower_bound(snapshot.total, snapshot.divergences, self.config.z);
        let mode = self.config.thresholds.mode_for(score);
        debug!(node = %node_id, total = snapshot.total, divergences = snapshot.divergences, score, %mode, "confidence");
        mode
    }

    /// Forget a node's counters
    pub fn reset(&self, node_id: &NodeId) {
        self.nodes.write().remove(node_id);
    }

    /// Nodes with counters
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy every node's counters
    #[must_use]
    pub fn export(&self) -> EstimatorState {
        EstimatorState {
            nodes: self
                .nodes
                .read()
                .iter()
                .map(|(id, m)| (id.clone(), m.snapshot()))
                .collect(),
        }
    }

    /// Replace counters with previously exported state
    ///
    /// Nodes absent from `state` keep their current counters.
    pub fn import(&self, state: &EstimatorState) {
        let mut nodes = self.nodes.write();
        for (id, snapshot) in &state.nodes {
            nodes.insert(id.clone(), Arc::new(RuntimeMetrics::from_snapshot(snapshot)));
        }
    }

    /// Export as JSON
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn export_json(&self) -> VerifyResult<String> {
        Ok(serde_json::to_string(&self.export())?)
    }

    /// Import from JSON produced by [`ConfidenceEstimator::export_json`]
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn import_json(&self, json: &str) -> VerifyResult<()> {
        let state: EstimatorState = serde_json::from_str(json)?;
        self.import(&state);
        Ok(())
    }
}

//! Execution monitor for per-node aggregates.
//!
//! Counts calls by path, errors, divergences, fallbacks and cache hits, and
//! keeps a bounded window of recent latencies for percentile reporting.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use twinpath_core::{ExecutionPath, NodeId};

/// Latency samples kept per node
pub const DEFAULT_LATENCY_WINDOW: usize = 10_000;

/// Aggregated view of one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAggregate {
    /// Backend calls of either path
    pub executions: u64,
    /// Reference backend calls
    pub reference_executions: u64,
    /// Optimized backend calls
    pub optimized_executions: u64,
    /// Requests answered from the result cache
    pub cache_hits: u64,
    /// Failed backend calls
    pub errors: u64,
    /// Comparisons that diverged
    pub divergences: u64,
    /// Fallbacks to reference
    pub fallbacks: u64,
    /// Mean reference latency
    pub avg_reference_ms: f64,
    /// Mean optimized latency
    pub avg_optimized_ms: f64,
    /// Median latency over the window
    pub p50_ms: f64,
    /// 95th percentile latency
    pub p95_ms: f64,
    /// 99th percentile latency
    pub p99_ms: f64,
}

impl NodeAggregate {
    /// Percentage of executions that returned an error
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.errors as f64 / self.executions as f64 * 100.0
    }

    /// Percentage of executions that diverged
    #[must_use]
    pub fn divergence_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.divergences as f64 / self.executions as f64 * 100.0
    }
}

#[derive(Debug, Default)]
struct NodeWindow {
    aggregate: NodeAggregate,
    reference_total_ms: f64,
    optimized_total_ms: f64,
    latencies: VecDeque<f64>,
}

/// Per-node execution aggregates
#[derive(Debug)]
pub struct ExecutionMonitor {
    window: usize,
    nodes: RwLock<HashMap<NodeId, Arc<Mutex<NodeWindow>>>>,
}

impl ExecutionMonitor {
    /// Create a monitor keeping `window` latency samples per node
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, node_id: &NodeId) -> Arc<Mutex<NodeWindow>> {
        if let Some(w) = self.nodes.read().get(node_id) {
            return w.clone();
        }
        self.nodes.write().entry(node_id.clone()).or_default().clone()
    }

    /// Record one answered call
    pub fn record_execution(&self, node_id: &NodeId, path: ExecutionPath, elapsed: Duration, success: bool) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let entry = self.entry(node_id);
        let mut w = entry.lock();
        w.aggregate.executions += 1;
        match path {
            ExecutionPath::Reference => {
                w.aggregate.reference_executions += 1;
                w.reference_total_ms += ms;
            }
            ExecutionPath::Optimized => {
                w.aggregate.optimized_executions += 1;
                w.optimized_total_ms += ms;
            }
        }
        if !success {
            w.aggregate.errors += 1;
        }
        w.latencies.push_back(ms);
        while w.latencies.len() > self.window {
            w.latencies.pop_front();
        }
    }

    /// Record a cache hit
    pub fn record_cache_hit(&self, node_id: &NodeId) {
        self.entry(node_id).lock().aggregate.cache_hits += 1;
    }

    /// Record a divergence
    pub fn record_divergence(&self, node_id: &NodeId) {
        self.entry(node_id).lock().aggregate.divergences += 1;
    }

    /// Record a fallback
    pub fn record_fallback(&self, node_id: &NodeId) {
        self.entry(node_id).lock().aggregate.fallbacks += 1;
    }

    /// Aggregates for one node; defaults if never seen
    #[must_use]
    pub fn aggregate(&self, node_id: &NodeId) -> NodeAggregate {
        let Some(entry) = self.nodes.read().get(node_id).cloned() else {
            return NodeAggregate::default();
        };
        let w = entry.lock();
        let mut agg = w.aggregate.clone();
        if agg.reference_executions > 0 {
            agg.avg_reference_ms = w.reference_total_ms / agg.reference_executions as f64;
        }
        if agg.optimized_executions > 0 {
            agg.avg_optimized_ms = w.optimized_total_ms / agg.optimized_executions as f64;
        }
        if !w.latencies.is_empty() {
            let mut sorted: Vec<f64> = w.latencies.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            let n = sorted.len();
            let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
            agg.p50_ms = at(0.50);
            agg.p95_ms = at(0.95);
            agg.p99_ms = at(0.99);
        }
        agg
    }

    /// Aggregates for every node
    #[must_use]
    pub fn all(&self) -> BTreeMap<NodeId, NodeAggregate> {
        let ids: Vec<NodeId> = self.nodes.read().keys().cloned().collect();
        ids.into_iter()
            .map(|id| {
                let agg = self.aggregate(&id);
                (id, agg)
            })
            .collect()
    }

    /// Drop aggregates for one node, or all nodes
    pub fn reset(&self, node_id: Option<&NodeId>) {
        let mut nodes = self.nodes.write();
        match node_id {
            Some(id) => {
                nodes.remove(id);
            }
            None => nodes.clear(),
        }
    }

    /// Render counters in the Prometheus text exposition format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let all = self.all();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP twinpath_executions_total Executions answered, by path");
        let _ = writeln!(out, "# TYPE twinpath_executions_total counter");
        for (id, agg) in &all {
            let _ = writeln!(
                out,
                "twinpath_executions_total{{node_id=\"{}\",path=\"reference\"}} {}",
                id, agg.reference_executions
            );
            let _ = writeln!(
                out,
                "twinpath_executions_total{{node_id=\"{}\",path=\"optimized\"}} {}",
                id, agg.optimized_executions
            );
        }

        let counters: [(&str, &str, fn(&NodeAggregate) -> u64); 4] = [
            ("twinpath_errors_total", "Executions that returned an error", |a| a.errors),
            ("twinpath_divergences_total", "Comparisons that diverged", |a| a.divergences),
            ("twinpath_fallbacks_total", "Fallbacks to the reference backend", |a| a.fallbacks),
            ("twinpath_cache_hits_total", "Results served from the result cache", |a| a.cache_hits),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            for (id, agg) in &all {
                let _ = writeln!(out, "{}{{node_id=\"{}\"}} {}", name, id, value(agg));
            }
        }

        let _ = writeln!(out, "# HELP twinpath_latency_ms Recent latency percentiles");
        let _ = writeln!(out, "# TYPE twinpath_latency_ms gauge");
        for (id, agg) in &all {
            for (q, v) in [("0.5", agg.p50_ms), ("0.95", agg.p95_ms), ("0.99", agg.p99_ms)] {
                let _ = writeln!(out, "twinpath_latency_ms{{node_id=\"{}\",quantile=\"{}\"}} {}", id, q, v);
            }
        }
        out
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

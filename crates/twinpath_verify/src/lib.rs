//! TWINPATH Verification
//!
//! Deep structural comparison of backend outputs, the Wilson-bound
//! confidence estimator that turns divergence counts into routing modes,
//! and per-node execution aggregates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compare;
pub mod confidence;
pub mod error;
pub mod monitor;

pub use compare::{CompareConfig, Comparator, FieldKind, OutputShape};
pub use confidence::{
    ConfidenceConfig, ConfidenceEstimator, EstimatorState, MetricsSnapshot, ModeThresholds,
    RuntimeMetrics, wilson_lower_bound,
};
pub use error::{VerifyError, VerifyResult};
pub use monitor::{ExecutionMonitor, NodeAggregate};

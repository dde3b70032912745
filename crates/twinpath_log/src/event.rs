//! Audit event types.
//!
//! Every event carries its own record id and wall-clock timestamp so sinks
//! can store them independently of arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use twinpath_core::{
    Difference, ExecutionMode, ExecutionPath, Fields, NodeId, Outcome, RecordId, Version,
};

/// One completed call as seen by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Record identifier
    pub id: RecordId,
    /// Node that ran
    pub node_id: NodeId,
    /// Node version
    pub version: Version,
    /// Mode in effect
    pub mode: ExecutionMode,
    /// Backend that answered
    pub path: ExecutionPath,
    /// Wall time in microseconds
    pub duration_us: u64,
    /// Outcome was success-tagged
    pub success: bool,
    /// Answered from the result cache
    pub cached: bool,
    /// When the call finished
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Create an execution event stamped now
    #[must_use]
    pub fn new(
        node_id: NodeId,
        version: Version,
        mode: ExecutionMode,
        path: ExecutionPath,
        duration: Duration,
        success: bool,
    ) -> Self {
        Self {
            id: RecordId::new(),
            node_id,
            version,
            mode,
            path,
            duration_us: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
            success,
            cached: false,
            timestamp: Utc::now(),
        }
    }

    /// Mark the result as served from the result cache
    #[must_use]
    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }
}

/// What one backend produced during a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedResult {
    /// The backend returned a well-formed outcome
    Completed {
        /// Returned outcome
        outcome: Outcome,
    },
    /// The backend failed to produce an outcome
    Failed {
        /// Backend name
        backend: String,
        /// Failure description
        message: String,
    },
}

impl ObservedResult {
    /// Check if the backend completed
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// A structural mismatch between the two backends for identical inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceRecord {
    /// Record identifier
    pub id: RecordId,
    /// Node that ran
    pub node_id: NodeId,
    /// Node version
    pub version: Version,
    /// Mode in effect
    pub mode: ExecutionMode,
    /// Inputs both backends saw
    pub inputs: Fields,
    /// Reference side
    pub reference: ObservedResult,
    /// Optimized side
    pub optimized: ObservedResult,
    /// Structural differences, empty when a side failed
    pub differences: Vec<Difference>,
    /// When the divergence was observed
    pub timestamp: DateTime<Utc>,
}

impl DivergenceRecord {
    /// Create a divergence record stamped now
    #[must_use]
    pub fn new(
        node_id: NodeId,
        version: Version,
        mode: ExecutionMode,
        inputs: Fields,
        reference: ObservedResult,
        optimized: ObservedResult,
    ) -> Self {
        Self {
            id: RecordId::new(),
            node_id,
            version,
            mode,
            inputs,
            reference,
            optimized,
            differences: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the structural differences
    #[must_use]
    pub fn with_differences(mut self, differences: Vec<Difference>) -> Self {
        self.differences = differences;
        self
    }

    /// Override the timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// The optimized backend failed and the reference backend answered instead
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEvent {
    /// Record identifier
    pub id: RecordId,
    /// Node that ran
    pub node_id: NodeId,
    /// Node version
    pub version: Version,
    /// Mode in effect
    pub mode: ExecutionMode,
    /// Backend that failed
    pub backend: String,
    /// Failure description
    pub reason: String,
    /// When the fallback happened
    pub timestamp: DateTime<Utc>,
}

impl FallbackEvent {
    /// Create a fallback event stamped now
    #[must_use]
    pub fn new(
        node_id: NodeId,
        version: Version,
        mode: ExecutionMode,
        backend: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            node_id,
            version,
            mode,
            backend: backend.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Progress of a hot-path compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompilationStatus {
    /// Threshold crossed, compilation requested
    Started {
        /// Calls observed when the threshold was crossed
        calls: u64,
    },
    /// Artifact installed
    Succeeded {
        /// Artifact identifier
        artifact: String,
    },
    /// Compilation failed; the node stays interpreted
    Failed {
        /// Failure description
        reason: String,
    },
}

/// Hot-path compilation lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationEvent {
    /// Record identifier
    pub id: RecordId,
    /// Node that ran
    pub node_id: NodeId,
    /// Node version
    pub version: Version,
    /// Lifecycle step
    pub status: CompilationStatus,
    /// When the step happened
    pub timestamp: DateTime<Utc>,
}

impl CompilationEvent {
    /// Create a compilation event stamped now
    #[must_use]
    pub fn new(node_id: NodeId, version: Version, status: CompilationStatus) -> Self {
        Self {
            id: RecordId::new(),
            node_id,
            version,
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Anything the engine reports to an audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A call was answered
    Execution(ExecutionEvent),
    /// The backends disagreed
    Divergence(DivergenceRecord),
    /// Optimized failed, reference answered
    Fallback(FallbackEvent),
    /// Hot-path compilation progress
    Compilation(CompilationEvent),
}

impl AuditEvent {
    /// Node the event is about
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Execution(e) => &e.node_id,
            Self::Divergence(d) => &d.node_id,
            Self::Fallback(f) => &f.node_id,
            Self::Compilation(c) => &c.node_id,
        }
    }

    /// Short event type name
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Execution(_) => "execution",
            Self::Divergence(_) => "divergence",
            Self::Fallback(_) => "fallback",
            Self::Compilation(_) => "compilation",
        }
    }

    /// Wall-clock time of the event
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Execution(e) => e.timestamp,
            Self::Divergence(d) => d.timestamp,
            Self::Fallback(f) => f.timestamp,
            Self::Compilation(c) => c.timestamp,
        }
    }
}

impl From<ExecutionEvent> for AuditEvent {
    fn from(event: ExecutionEvent) -> Self {
        Self::Execution(event)
    }
}

impl From<DivergenceRecord> for AuditEvent {
    fn from(record: DivergenceRecord) -> Self {
        Self::Divergence(record)
    }
}

impl From<FallbackEvent> for AuditEvent {
    fn from(event: FallbackEvent) -> Self {
        Self::Fallback(event)
    }
}

impl From<CompilationEvent> for AuditEvent {
    fn from(event: CompilationEvent) -> Self {
        Self::Compilation(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinpath_core::{fields, DifferenceKind, Value};

    fn node() -> NodeId {
        NodeId::new("add_v1").unwrap()
    }

    #[test]
    fn test_execution_event_duration() {
        let event = ExecutionEvent::new(
            node(),
            Version::default(),
            ExecutionMode::DualVerify,
            ExecutionPath::Reference,
            Duration::from_millis(3),
            true,
        );
        assert_eq!(event.duration_us, 3000);
        assert!(!event.cached);
        assert!(event.with_cached(true).cached);
    }

    #[test]
    fn test_divergence_record_json() {
        let record = DivergenceRecord::new(
            node(),
            Version::default(),
            ExecutionMode::DualVerify,
            fields! { "a" => 1, "b" => 2 },
            ObservedResult::Completed {
                outcome: Outcome::success(fields! { "result" => 3 }),
            },
            ObservedResult::Completed {
                outcome: Outcome::success(fields! { "result" => 4 }),
            },
        )
        .with_differences(vec![Difference::new(
            DifferenceKind::NumericMismatch,
            "root.result",
            Some(Value::Int(3)),
            Some(Value::Int(4)),
        )]);

        let event = AuditEvent::from(record.clone());
        assert_eq!(event.kind(), "divergence");
        assert_eq!(event.node_id(), &node());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"divergence""#));
        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AuditEvent::Divergence(record));
    }

    #[test]
    fn test_failed_side_serializes() {
        let failed = ObservedResult::Failed {
            backend: "optimized".to_string(),
            message: "segfault in kernel".to_string(),
        };
        assert!(!failed.is_completed());
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains(r#""kind":"failed""#));
    }

    #[test]
    fn test_compilation_status_tagged() {
        let event = CompilationEvent::new(
            node(),
            Version::new(2, 0, 0),
            CompilationStatus::Started { calls: 100 },
        );
        let json = serde_json::to_string(&AuditEvent::from(event)).unwrap();
        assert!(json.contains(r#""status":"started""#));
        assert!(json.contains(r#""calls":100"#));
    }
}

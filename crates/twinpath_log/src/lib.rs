//! TWINPATH Audit Log
//!
//! Fire-and-forget audit events emitted by the engine, the sinks that
//! receive them, and a bounded in-memory history of divergences.
//! Emitting never blocks the request path.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event;
pub mod sink;
pub mod store;

pub use event::{
    AuditEvent, CompilationEvent, CompilationStatus, DivergenceRecord, ExecutionEvent,
    FallbackEvent, ObservedResult,
};
pub use sink::{AuditSink, ChannelSink, FanoutSink, MemorySink, NullSink, SinkError, TracingSink};
pub use store::{DivergenceStats, DivergenceStore};

//! Audit sinks.
//!
//! [`AuditSink::emit`] must return promptly: the engine calls it on the
//! request path. Sinks that do I/O should sit behind a [`ChannelSink`], which
//! hands events to a background consumer and drops them when it falls behind.

use crate::event::AuditEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// Channel buffer is full
    #[error("audit channel full")]
    Full,

    /// Consumer has gone away
    #[error("audit channel closed")]
    Closed,

    /// Persistence failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failed
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Receiver of audit events
pub trait AuditSink: Send + Sync {
    /// Deliver one event without blocking
    fn emit(&self, event: AuditEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Writes events as structured `tracing` lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn emit(&self, event: AuditEvent) {
        match &event {
            AuditEvent::Execution(e) => debug!(
                node = %e.node_id,
                mode = %e.mode,
                path = %e.path,
                duration_us = e.duration_us,
                success = e.success,
                cached = e.cached,
                "execution"
            ),
            AuditEvent::Divergence(d) => warn!(
                record = %d.id,
                node = %d.node_id,
                version = %d.version,
                mode = %d.mode,
                differences = d.differences.len(),
                first = %d.differences.first().map(ToString::to_string).unwrap_or_default(),
                "divergence detected"
            ),
            AuditEvent::Fallback(f) => warn!(
                node = %f.node_id,
                mode = %f.mode,
                backend = %f.backend,
                reason = %f.reason,
                "fell back to reference backend"
            ),
            AuditEvent::Compilation(c) => info!(
                node = %c.node_id,
                version = %c.version,
                status = ?c.status,
                "hot path compilation"
            ),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events received so far
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of events of the given kind (see [`AuditEvent::kind`])
    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Total number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if no events were received
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Remove and return all events
    pub fn take(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Bounded hand-off to a background consumer
///
/// Overflow drops the event and bumps a counter instead of waiting.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving half of its channel
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Create a sink whose events are forwarded to `consumer` on a spawned task
    ///
    /// Must be called from within a tokio runtime. The task ends once the
    /// sink is dropped and the buffer is drained.
    #[must_use]
    pub fn spawn(capacity: usize, consumer: Arc<dyn AuditSink>) -> (Self, JoinHandle<u64>) {
        let (sink, mut rx) = Self::new(capacity);
        let handle = tokio::spawn(async move {
            let mut forwarded = 0u64;
            while let Some(event) = rx.recv().await {
                consumer.emit(event);
                forwarded += 1;
            }
            forwarded
        });
        (sink, handle)
    }

    /// Try to enqueue an event
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Full`] or [`SinkError::Closed`] when the event
    /// could not be enqueued
    pub fn try_emit(&self, event: AuditEvent) -> Result<(), SinkError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    /// Events dropped because the channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelSink {
    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.try_emit(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(error = %e, dropped, "audit event dropped");
        }
    }
}

/// Delivers each event to several sinks in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    /// Create an empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a downstream sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of downstream sinks
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Check if there are no downstream sinks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutSink {
    fn emit(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

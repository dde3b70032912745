//! Result cache for idempotent nodes.
//!
//! Keyed by node and fingerprint (node, version, inputs, optional key).
//! Concurrent misses for the same key collapse into one computation; the
//! others wait for it and observe a hit. Only successful outcomes are kept.

use crate::error::{CacheError, EngineError};
use crate::result::ExecutionResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, error};
use twinpath_core::{Fingerprint, NodeId};

type Slot = Arc<OnceCell<ExecutionResult>>;

/// Why a computation did not populate its slot
enum Flight {
    Failed(EngineError),
    Uncacheable(ExecutionResult),
}

/// Single-flight result cache
#[derive(Debug, Default)]
pub struct ResultCache {
    slots: RwLock<HashMap<(NodeId, Fingerprint), Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, node_id: &NodeId, fingerprint: Fingerprint) -> Slot {
        let key = (node_id.clone(), fingerprint);
        if let Some(slot) = self.slots.read().get(&key) {
            return slot.clone();
        }
        self.slots.write().entry(key).or_default().clone()
    }

    /// Cached result, if any
    #[must_use]
    pub fn get(&self, node_id: &NodeId, fingerprint: Fingerprint) -> Option<ExecutionResult> {
        let found = self
            .slots
            .read()
            .get(&(node_id.clone(), fingerprint))
            .and_then(|slot| slot.get().cloned());
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store a result
    ///
    /// Error outcomes are ignored. Storing the same outcome twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Inconsistent`] if a different outcome is
    /// already cached under this key
    pub fn put(
        &self,
        node_id: &NodeId,
        fingerprint: Fingerprint,
        result: ExecutionResult,
    ) -> Result<(), CacheError> {
        if !result.outcome.is_success() {
            return Ok(());
        }
        let slot = self.slot(node_id, fingerprint);
        let stored = match slot.set(result.clone()) {
            Ok(()) => return Ok(()),
            Err(_) => slot.get(),
        };
        match stored {
            Some(existing) if existing.outcome != result.outcome => {
                error!(node = %node_id, fingerprint = %fingerprint, "cached outcome differs from recomputed outcome");
                Err(CacheError::Inconsistent {
                    node_id: node_id.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Cached result, or run `compute` exactly once across concurrent callers
    ///
    /// Returns the result and whether it came from the cache. Callers that
    /// waited on another caller's computation count as hits.
    ///
    /// # Errors
    ///
    /// Returns whatever error `compute` returned; the slot stays empty so
    /// the next caller retries
    pub async fn get_or_compute<F, Fut>(
        &self,
        node_id: &NodeId,
        fingerprint: Fingerprint,
        compute: F,
    ) -> Result<(ExecutionResult, bool), EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionResult, EngineError>>,
    {
        let slot = self.slot(node_id, fingerprint);
        if let Some(result) = slot.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((result.clone(), true));
        }

        let ran = AtomicBool::new(false);
        let ran_ref = &ran;
        let flight = slot
            .get_or_try_init(|| async move {
                ran_ref.store(true, Ordering::SeqCst);
                match compute().await {
                    Ok(result) if result.outcome.is_success() => Ok(result),
                    Ok(result) => Err(Flight::Uncacheable(result)),
                    Err(err) => Err(Flight::Failed(err)),
                }
            })
            .await;

        match flight {
            Ok(result) => {
                let hit = !ran.load(Ordering::SeqCst);
                if hit {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(node = %node_id, fingerprint = %fingerprint, "result cached");
                }
                Ok((result.clone(), hit))
            }
            Err(flight) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.discard_empty(node_id, fingerprint, &slot);
                match flight {
                    Flight::Uncacheable(result) => Ok((result, false)),
                    Flight::Failed(err) => Err(err),
                }
            }
        }
    }

    fn discard_empty(&self, node_id: &NodeId, fingerprint: Fingerprint, slot: &Slot) {
        let mut slots = self.slots.write();
        let key = (node_id.clone(), fingerprint);
        let remove = slots
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if remove {
            slots.remove(&key);
        }
    }

    /// Drop every entry for a node; returns how many were removed
    pub fn invalidate_node(&self, node_id: &NodeId) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|(id, _), _| id != node_id);
        before - slots.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    /// Number of populated entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookups served from the cache
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that had to compute
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

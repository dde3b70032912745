//! Hot-path compilation tracking.
//!
//! Counts optimized-path calls per node version. The call that crosses the
//! threshold wins a compare-and-swap from `Interpreted` to `Compiling` and
//! is the only one that requests compilation. A version change starts the
//! count over and discards any artifact built for the old version.

use crate::backend::CompiledArtifact;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use twinpath_core::{NodeId, Version};

/// Compilation state of one node version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompilationState {
    /// Running through the backend's interpreter
    Interpreted = 0,
    /// A compilation has been requested and not finished
    Compiling = 1,
    /// A compiled artifact is installed
    Compiled = 2,
}

impl CompilationState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Compiling,
            2 => Self::Compiled,
            _ => Self::Interpreted,
        }
    }
}

#[derive(Debug)]
struct HotEntry {
    version: Version,
    calls: AtomicU64,
    state: AtomicU8,
    artifact: OnceLock<Arc<CompiledArtifact>>,
}

impl HotEntry {
    fn new(version: Version) -> Self {
        Self {
            version,
            calls: AtomicU64::new(0),
            state: AtomicU8::new(CompilationState::Interpreted as u8),
            artifact: OnceLock::new(),
        }
    }

    fn state(&self) -> CompilationState {
        CompilationState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Summary across every tracked node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HotPathStats {
    /// Nodes with an entry
    pub tracked: usize,
    /// Entries still interpreted
    pub interpreted: usize,
    /// Entries with a compilation in flight
    pub compiling: usize,
    /// Entries with an installed artifact
    pub compiled: usize,
    /// Calls counted across all entries
    pub total_calls: u64,
}

/// Per-node call counters and compiled artifacts
#[derive(Debug)]
pub struct HotPathCache {
    threshold: u64,
    entries: RwLock<HashMap<NodeId, Arc<HotEntry>>>,
}

impl HotPathCache {
    /// Create a cache that compiles after `threshold` calls
    #[must_use]
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Calls needed before compilation is requested
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Entry for `version`, replacing an entry for an older version;
    /// `None` when a newer version is already tracked
    fn entry(&self, node_id: &NodeId, version: Version) -> Option<Arc<HotEntry>> {
        if let Some(entry) = self.entries.read().get(node_id) {
            if entry.version == version {
                return Some(entry.clone());
            }
            if entry.version > version {
                return None;
            }
        }
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(node_id) {
            if current.version == version {
                return Some(current.clone());
            }
            if current.version > version {
                return None;
            }
            info!(node = %node_id, old = %current.version, new = %version, "version changed, hot-path entry reset");
        }
        let entry = Arc::new(HotEntry::new(version));
        entries.insert(node_id.clone(), entry.clone());
        Some(entry)
    }

    fn existing(&self, node_id: &NodeId, version: Version) -> Option<Arc<HotEntry>> {
        self.entries
            .read()
            .get(node_id)
            .filter(|entry| entry.version == version)
            .cloned()
    }

    /// Count one call; returns `true` for exactly one caller once the
    /// threshold is reached, which must then run the compilation
    ///
    /// Calls for a version older than the tracked one are not counted.
    pub fn note_call(&self, node_id: &NodeId, version: Version) -> bool {
        let Some(entry) = self.entry(node_id, version) else {
            debug!(node = %node_id, %version, "call for superseded version not counted");
            return false;
        };
        let calls = entry.calls.fetch_add(1, Ordering::AcqRel) + 1;
        if calls < self.threshold {
            return false;
        }
        let won = entry
            .state
            .compare_exchange(
                CompilationState::Interpreted as u8,
                CompilationState::Compiling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            debug!(node = %node_id, %version, calls, "hot-path threshold crossed");
        }
        won
    }

    /// Install a compiled artifact
    ///
    /// Returns `false` if the entry was replaced by a newer version while
    /// compiling, in which case the artifact is discarded.
    pub fn finish_compilation(
        &self,
        node_id: &NodeId,
        version: Version,
        artifact: CompiledArtifact,
    ) -> bool {
        let Some(entry) = self.existing(node_id, version) else {
            debug!(node = %node_id, %version, "stale artifact discarded");
            return false;
        };
        if entry.artifact.set(Arc::new(artifact)).is_err() {
            return false;
        }
        entry
            .state
            .store(CompilationState::Compiled as u8, Ordering::Release);
        info!(node = %node_id, %version, "compiled artifact installed");
        true
    }

    /// Record a failed compilation
    ///
    /// The node goes back to `Interpreted` with its counter cleared, so
    /// another attempt happens only after a further `threshold` calls.
    pub fn fail_compilation(&self, node_id: &NodeId, version: Version) {
        if let Some(entry) = self.existing(node_id, version) {
            entry.calls.store(0, Ordering::Release);
            entry
                .state
                .store(CompilationState::Interpreted as u8, Ordering::Release);
            warn!(node = %node_id, %version, "compilation failed, staying interpreted");
        }
    }

    /// Artifact for exactly this node version
    #[must_use]
    pub fn get_compiled(&self, node_id: &NodeId, version: Version) -> Option<Arc<CompiledArtifact>> {
        self.existing(node_id, version)
            .and_then(|entry| entry.artifact.get().cloned())
    }

    /// Current state; untracked nodes are `Interpreted`
    #[must_use]
    pub fn state(&self, node_id: &NodeId) -> CompilationState {
        self.entries
            .read()
            .get(node_id)
            .map_or(CompilationState::Interpreted, |entry| entry.state())
    }

    /// Calls counted for the current version
    #[must_use]
    pub fn call_count(&self, node_id: &NodeId) -> u64 {
        self.entries
            .read()
            .get(node_id)
            .map_or(0, |entry| entry.calls.load(Ordering::Acquire))
    }

    /// Forget a node
    pub fn invalidate(&self, node_id: &NodeId) {
        if self.entries.write().remove(node_id).is_some() {
            info!(node = %node_id, "hot-path entry invalidated");
        }
    }

    /// Summary across every tracked node
    #[must_use]
    pub fn stats(&self) -> HotPathStats {
        let entries = self.entries.read();
        let mut stats = HotPathStats {
            tracked: entries.len(),
            ..HotPathStats::default()
        };
        for entry in entries.values() {
            stats.total_calls += entry.calls.load(Ordering::Acquire);
            match entry.state() {
                CompilationState::Interpreted => stats.interpreted += 1,
                CompilationState::Compiling => stats.compiling += 1,
                CompilationState::Compiled => stats.compiled += 1,
            }
        }
        stats
    }
}

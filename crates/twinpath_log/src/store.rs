//! Bounded in-memory history of divergences.
//!
//! Keeps the most recent records per node, answers time-range queries, and
//! summarizes divergences by mode and by difference kind. The whole store
//! can be exported to JSON and loaded back.

use crate::event::{AuditEvent, DivergenceRecord};
use crate::sink::{AuditSink, SinkError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use twinpath_core::{DifferenceKind, ExecutionMode, NodeId};

/// Default number of records kept per node
pub const DEFAULT_MAX_PER_NODE: usize = 1000;

/// Summary of stored divergences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceStats {
    /// Records stored for the node
    pub total: u64,
    /// Records per routing mode
    pub by_mode: BTreeMap<ExecutionMode, u64>,
    /// Differences per kind
    pub by_kind: BTreeMap<DifferenceKind, u64>,
    /// Oldest stored record
    pub first_seen: Option<DateTime<Utc>>,
    /// Newest stored record
    pub last_seen: Option<DateTime<Utc>>,
}

impl DivergenceStats {
    fn add(&mut self, record: &DivergenceRecord) {
        self.total += 1;
        *self.by_mode.entry(record.mode).or_default() += 1;
        for diff in &record.differences {
            *self.by_kind.entry(diff.kind).or_default() += 1;
        }
        self.first_seen = Some(match self.first_seen {
            Some(t) => t.min(record.timestamp),
            None => record.timestamp,
        });
        self.last_seen = Some(match self.last_seen {
            Some(t) => t.max(record.timestamp),
            None => record.timestamp,
        });
    }

    /// Difference kinds ordered by frequency, most common first
    #[must_use]
    pub fn most_common_kinds(&self, limit: usize) -> Vec<(DifferenceKind, u64)> {
        let mut kinds: Vec<(DifferenceKind, u64)> =
            self.by_kind.iter().map(|(k, n)| (*k, *n)).collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        kinds.truncate(limit);
        kinds
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    max_per_node: usize,
    records: BTreeMap<NodeId, Vec<DivergenceRecord>>,
}

/// Divergence history, usable directly as an [`AuditSink`]
#[derive(Debug)]
pub struct DivergenceStore {
    max_per_node: usize,
    records: RwLock<HashMap<NodeId, VecDeque<DivergenceRecord>>>,
}

impl DivergenceStore {
    /// Create a store keeping up to `max_per_node` records per node
    #[must_use]
    pub fn new(max_per_node: usize) -> Self {
        Self {
            max_per_node: max_per_node.max(1),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Per-node retention limit
    #[must_use]
    pub fn max_per_node(&self) -> usize {
        self.max_per_node
    }

    /// Append a record, evicting the oldest one for that node when full
    pub fn record(&self, record: DivergenceRecord) {
        let mut records = self.records.write();
        let history = records.entry(record.node_id.clone()).or_default();
        history.push_back(record);
        while history.len() > self.max_per_node {
            history.pop_front();
        }
    }

    /// Records for a node, newest first, after skipping `offset`
    #[must_use]
    pub fn for_node(&self, node_id: &NodeId, limit: usize, offset: usize) -> Vec<DivergenceRecord> {
        self.records
            .read()
            .get(node_id)
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records with `start <= timestamp <= end`, newest first
    #[must_use]
    pub fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        node_id: Option<&NodeId>,
    ) -> Vec<DivergenceRecord> {
        let records = self.records.read();
        let mut found: Vec<DivergenceRecord> = records
            .iter()
            .filter(|(id, _)| node_id.is_none_or(|wanted| *id == wanted))
            .flat_map(|(_, history)| history.iter())
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found
    }

    /// Statistics for one node
    #[must_use]
    pub fn stats(&self, node_id: &NodeId) -> DivergenceStats {
        let mut stats = DivergenceStats::default();
        if let Some(history) = self.records.read().get(node_id) {
            for record in history {
                stats.add(record);
            }
        }
        stats
    }

    /// Statistics for every node with stored records
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<NodeId, DivergenceStats> {
        self.records
            .read()
            .iter()
            .map(|(id, history)| {
                let mut stats = DivergenceStats::default();
                for record in history {
                    stats.add(record);
                }
                (id.clone(), stats)
            })
            .collect()
    }

    /// Total stored records across nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().values().map(VecDeque::len).sum()
    }

    /// Check if nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records for one node, or for all nodes; returns how many were removed
    pub fn clear(&self, node_id: Option<&NodeId>) -> usize {
        let mut records = self.records.write();
        match node_id {
            Some(id) => records.remove(id).map_or(0, |h| h.len()),
            None => {
                let count = records.values().map(VecDeque::len).sum();
                records.clear();
                count
            }
        }
    }

    /// Serialize the whole store
    ///
    /// # Errors
    ///
    /// Returns error if a record cannot be encoded
    pub fn export_json(&self) -> Result<String, SinkError> {
        let snapshot = Snapshot {
            max_per_node: self.max_per_node,
            records: self
                .records
                .read()
                .iter()
                .map(|(id, history)| (id.clone(), history.iter().cloned().collect()))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Rebuild a store from [`DivergenceStore::export_json`] output
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn import_json(json: &str) -> Result<Self, SinkError> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        let store = Self::new(snapshot.max_per_node);
        for record in snapshot.records.into_values().flatten() {
            store.record(record);
        }
        Ok(store)
    }

    /// Write the store to a file
    ///
    /// # Errors
    ///
    /// Returns error on encoding or I/O failure
    pub fn save(&self, path: &Path) -> Result<(), SinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.export_json()?)?;
        Ok(())
    }

    /// Load a store from a file written by [`DivergenceStore::save`]
    ///
    /// # Errors
    ///
    /// Returns error on I/O or decoding failure
    pub fn load(path: &Path) -> Result<Self, SinkError> {
        let json = std::fs::read_to_string(path)?;
        Self::import_json(&json)
    }
}

impl Default for DivergenceStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_NODE)
    }
}

impl AuditSink for DivergenceStore {
    fn emit(&self, event: AuditEvent) {
        if let AuditEvent::Divergence(record) = event {
            self.record(record);
        }
    }
}

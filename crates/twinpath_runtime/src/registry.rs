//! Node registry.
//!
//! Descriptors are validated once, when they are loaded, so the request
//! path never rechecks required/denied disjointness.

use crate::descriptor::NodeDescriptor;
use crate::error::RegistryError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use twinpath_core::NodeId;

/// Source of node descriptors
pub trait NodeRegistry: Send + Sync {
    /// Descriptor currently registered under `node_id`
    fn lookup(&self, node_id: &NodeId) -> Option<Arc<NodeDescriptor>>;
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<NodeDescriptor>>>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new descriptor
    ///
    /// # Errors
    ///
    /// Returns error if the descriptor is invalid or the identifier is taken
    pub fn register(&self, descriptor: NodeDescriptor) -> Result<Arc<NodeDescriptor>, RegistryError> {
        descriptor.validate()?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&descriptor.id) {
            return Err(RegistryError::AlreadyRegistered {
                node_id: descriptor.id,
            });
        }
        let descriptor = Arc::new(descriptor);
        nodes.insert(descriptor.id.clone(), descriptor.clone());
        info!(node = %descriptor.id, version = %descriptor.version, "node registered");
        Ok(descriptor)
    }

    /// Install a descriptor, replacing any existing one (e.g. a version bump)
    ///
    /// # Errors
    ///
    /// Returns error if the descriptor is invalid
    pub fn replace(&self, descriptor: NodeDescriptor) -> Result<Option<Arc<NodeDescriptor>>, RegistryError> {
        descriptor.validate()?;
        let descriptor = Arc::new(descriptor);
        let previous = self
            .nodes
            .write()
            .insert(descriptor.id.clone(), descriptor.clone());
        info!(
            node = %descriptor.id,
            version = %descriptor.version,
            previous = ?previous.as_ref().map(|p| p.version.to_string()),
            "node replaced"
        );
        Ok(previous)
    }

    /// Load a JSON array of descriptors
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON or the first invalid descriptor
    pub fn load_json(&self, json: &str) -> Result<usize, RegistryError> {
        let descriptors: Vec<NodeDescriptor> = serde_json::from_str(json)?;
        let count = descriptors.len();
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(count)
    }

    /// Remove a descriptor
    pub fn remove(&self, node_id: &NodeId) -> Option<Arc<NodeDescriptor>> {
        self.nodes.write().remove(node_id)
    }

    /// Number of registered nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Registered identifiers, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl NodeRegistry for InMemoryRegistry {
    fn lookup(&self, node_id: &NodeId) -> Option<Arc<NodeDescriptor>> {
        self.nodes.read().get(node_id).cloned()
    }
}

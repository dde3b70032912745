//! Node descriptors.
//!
//! A descriptor is the loaded, immutable definition of one node version:
//! its capability requirements, idempotency contract, and declared output
//! shape. Descriptors are shared as `Arc<NodeDescriptor>`.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use twinpath_core::{CapabilitySet, NodeId, Version};
use twinpath_verify::{FieldKind, OutputShape};

/// How a caller-supplied idempotency key participates in caching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// The key is never folded into the cache fingerprint
    Ignored,
    /// The key is folded when supplied; calls without one share by inputs
    #[default]
    Optional,
    /// Calls without a key are rejected
    Required,
}

impl KeyPolicy {
    /// The part of `key` that goes into the fingerprint
    #[must_use]
    pub fn fold<'a>(self, key: Option<&'a str>) -> Option<&'a str> {
        match self {
            Self::Ignored => None,
            Self::Optional | Self::Required => key,
        }
    }
}

/// Loaded definition of one node version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node identifier
    pub id: NodeId,
    /// Definition version
    #[serde(default)]
    pub version: Version,
    /// Identical inputs may be served from the result cache
    #[serde(default)]
    pub idempotent: bool,
    /// Idempotency key handling
    #[serde(default)]
    pub key_policy: KeyPolicy,
    /// Capabilities every caller must hold
    #[serde(default)]
    pub required: CapabilitySet,
    /// Capabilities the node must never be run with
    #[serde(default)]
    pub denied: CapabilitySet,
    /// Declared type of each top-level output field
    #[serde(default)]
    pub output_shape: OutputShape,
}

impl NodeDescriptor {
    /// Create a non-idempotent descriptor with no capability requirements
    #[must_use]
    pub fn new(id: NodeId, version: Version) -> Self {
        Self {
            id,
            version,
            idempotent: false,
            key_policy: KeyPolicy::default(),
            required: CapabilitySet::new(),
            denied: CapabilitySet::new(),
            output_shape: OutputShape::new(),
        }
    }

    /// Declare idempotency
    #[must_use]
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Set the key policy
    #[must_use]
    pub fn with_key_policy(mut self, policy: KeyPolicy) -> Self {
        self.key_policy = policy;
        self
    }

    /// Set required capabilities
    #[must_use]
    pub fn with_required(mut self, required: CapabilitySet) -> Self {
        self.required = required;
        self
    }

    /// Set denied capabilities
    #[must_use]
    pub fn with_denied(mut self, denied: CapabilitySet) -> Self {
        self.denied = denied;
        self
    }

    /// Declare one output field
    #[must_use]
    pub fn with_output_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.output_shape.insert(name.into(), kind);
        self
    }

    /// Check the descriptor is internally consistent
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapabilityConflict`] if a required capability
    /// is also denied, directly or through a denied wildcard
    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some(capability) = self.required.iter().find(|cap| self.denied.allows(cap)) {
            return Err(RegistryError::CapabilityConflict {
                node_id: self.id.clone(),
                capability: capability.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> NodeId {
        NodeId::new("charge_card").unwrap()
    }

    #[test]
    fn test_key_policy_fold() {
        assert_eq!(KeyPolicy::Ignored.fold(Some("k")), None);
        assert_eq!(KeyPolicy::Optional.fold(Some("k")), Some("k"));
        assert_eq!(KeyPolicy::Optional.fold(None), None);
        assert_eq!(KeyPolicy::Required.fold(Some("k")), Some("k"));
    }

    #[test]
    fn test_validate_conflict() {
        let ok = NodeDescriptor::new(id(), Version::default())
            .with_required(CapabilitySet::parse(["payments.charge"]).unwrap())
            .with_denied(CapabilitySet::parse(["net.egress"]).unwrap());
        assert!(ok.validate().is_ok());

        let direct = ok
            .clone()
            .with_denied(CapabilitySet::parse(["payments.charge"]).unwrap());
        assert!(matches!(
            direct.validate(),
            Err(RegistryError::CapabilityConflict { .. })
        ));

        let wildcard = ok.with_denied(CapabilitySet::parse(["payments.*"]).unwrap());
        assert!(wildcard.validate().is_err());
    }

    #[test]
    fn test_descriptor_from_json_defaults() {
        let json = r#"{
            "id": "add_v1",
            "idempotent": true,
            "required": ["math.add"],
            "output_shape": { "result": "int" }
        }"#;
        let d: NodeDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.id.as_str(), "add_v1");
        assert_eq!(d.version, Version::default());
        assert!(d.idempotent);
        assert_eq!(d.key_policy, KeyPolicy::Optional);
        assert_eq!(d.output_shape["result"], FieldKind::Int);
        assert!(d.denied.is_empty());
    }
}

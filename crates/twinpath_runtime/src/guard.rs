//! Capability guard.
//!
//! Fails closed: every capability the node requires must be covered by the
//! caller's grants. No side effects.

use crate::descriptor::NodeDescriptor;
use crate::error::GuardError;
use tracing::debug;
use twinpath_core::CapabilitySet;

/// Check that `granted` covers everything `descriptor` requires
///
/// # Errors
///
/// Returns the first missing capability in sorted order
pub fn authorize(descriptor: &NodeDescriptor, granted: &CapabilitySet) -> Result<(), GuardError> {
    match granted.first_missing(&descriptor.required) {
        Some(capability) => {
            debug!(node = %descriptor.id, %capability, "capability check failed");
            Err(GuardError::MissingCapability {
                capability: capability.clone(),
            })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinpath_core::{Capability, NodeId, Version};

    fn descriptor(required: &[&str]) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::new("charge_card").unwrap(), Version::default())
            .with_required(CapabilitySet::parse(required.iter().copied()).unwrap())
    }

    #[test]
    fn test_no_requirements() {
        assert!(authorize(&descriptor(&[]), &CapabilitySet::new()).is_ok());
    }

    #[test]
    fn test_all_granted() {
        let d = descriptor(&["payments.charge", "db.read"]);
        let granted = CapabilitySet::parse(["db.read", "payments.charge", "extra.cap"]).unwrap();
        assert!(authorize(&d, &granted).is_ok());
    }

    #[test]
    fn test_wildcard_grant() {
        let d = descriptor(&["payments.charge", "payments.refund"]);
        let granted = CapabilitySet::parse(["payments.*"]).unwrap();
        assert!(authorize(&d, &granted).is_ok());
    }

    #[test]
    fn test_reports_first_missing() {
        let d = descriptor(&["payments.charge", "db.read", "audit.write"]);
        let granted = CapabilitySet::parse(["db.read"]).unwrap();
        assert_eq!(
            authorize(&d, &granted),
            Err(GuardError::MissingCapability {
                capability: Capability::new("audit.write").unwrap()
            })
        );
    }
}

//! TWINPATH Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Node identity, capabilities, the structured value model that both
//! execution backends speak, the canonical fingerprints derived from it,
//! and the routing vocabulary shared by the other crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capability;
pub mod diff;
pub mod error;
pub mod hash;
pub mod id;
pub mod mode;
pub mod outcome;
pub mod value;
pub mod version;

// Re-exports
pub use capability::{Capability, CapabilitySet};
pub use diff::{Difference, DifferenceKind};
pub use error::{CoreError, CoreResult};
pub use hash::{Fingerprint, Fingerprinter};
pub use id::{NodeId, RecordId};
pub use mode::{ExecutionMode, ExecutionPath};
pub use outcome::{NodeError, Outcome};
pub use value::{Decimal, Fields, Value};
pub use version::Version;

//! TWINPATH Runtime
//!
//! Routes each node invocation to a trusted reference backend, a
//! performance-optimized backend, or both, and builds statistical
//! confidence in the optimized backend from the comparisons.
//!
//! Request flow: capability guard, result cache, confidence estimator,
//! backend(s), comparator, estimator update, caller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod guard;
pub mod hotpath;
pub mod registry;
pub mod result;
pub mod router;
pub mod shadow;
pub mod testing;

pub use backend::{Backend, BackendFailure, CompiledArtifact, Invocation};
pub use cache::ResultCache;
pub use config::{AuditConfig, EngineConfig, HotPathConfig, RoutingConfig, ShadowConfig};
pub use descriptor::{KeyPolicy, NodeDescriptor};
pub use error::{BackendError, CacheError, ConfigError, EngineError, GuardError, RegistryError};
pub use guard::authorize;
pub use hotpath::{CompilationState, HotPathCache, HotPathStats};
pub use registry::{InMemoryRegistry, NodeRegistry};
pub use result::ExecutionResult;
pub use router::{Engine, EngineBuilder, NodeMetrics};
pub use shadow::BackgroundPool;

//! What a caller gets back from the engine.

use std::time::Duration;
use twinpath_core::{ExecutionMode, ExecutionPath, Outcome};

/// Result of one [`crate::Engine::execute`] call
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Node outcome
    pub outcome: Outcome,
    /// Backend whose outcome was returned
    pub path: ExecutionPath,
    /// Mode the call was routed under
    pub mode: ExecutionMode,
    /// Wall time spent producing the outcome
    pub elapsed: Duration,
    /// The backends disagreed on this call
    pub diverged: bool,
}

impl ExecutionResult {
    /// Check if the node succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

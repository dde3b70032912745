//! Engine configuration.
//!
//! Every section has defaults, so an empty JSON object is a valid config.
//! Files are JSON; `TWINPATH_CONFIG` names a file to load.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use twinpath_core::{ExecutionMode, NodeId};
use twinpath_verify::{CompareConfig, ConfidenceConfig};

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "TWINPATH_CONFIG";

/// Traffic-splitting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Percent of canary traffic answered by the optimized backend
    pub canary_percent: u8,
    /// Fraction of optimized-only calls still verified against reference
    pub optimized_sample_rate: f64,
    /// Modes forced by an operator, overriding the estimator
    pub pinned: BTreeMap<NodeId, ExecutionMode>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            canary_percent: 5,
            optimized_sample_rate: 0.01,
            pinned: BTreeMap::new(),
        }
    }
}

/// Hot-path compilation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotPathConfig {
    /// Compile hot nodes at all
    pub enabled: bool,
    /// Optimized calls before compilation is requested
    pub threshold: u64,
}

impl Default for HotPathConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 100,
        }
    }
}

/// Background comparison settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Background comparisons allowed at once; extra work is dropped
    pub max_in_flight: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self { max_in_flight: 256 }
    }
}

/// Audit settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Divergence records retained per node
    pub divergence_history: usize,
    /// Buffer size for channel-backed sinks
    pub channel_capacity: usize,
    /// Emit an execution event for every call
    pub log_executions: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            divergence_history: 1000,
            channel_capacity: 1024,
            log_executions: true,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Estimator settings
    pub confidence: ConfidenceConfig,
    /// Traffic splitting
    pub routing: RoutingConfig,
    /// Comparator settings
    pub compare: CompareConfig,
    /// Hot-path compilation
    pub hot_path: HotPathConfig,
    /// Background comparisons
    pub shadow: ShadowConfig,
    /// Audit output
    pub audit: AuditConfig,
    /// Per-request deadline; none when unset
    pub request_timeout_ms: Option<u64>,
}

impl EngineConfig {
    /// Set confidence settings
    #[must_use]
    pub fn with_confidence(mut self, confidence: ConfidenceConfig) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set routing settings
    #[must_use]
    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    /// Set comparator settings
    #[must_use]
    pub fn with_compare(mut self, compare: CompareConfig) -> Self {
        self.compare = compare;
        self
    }

    /// Set hot-path settings
    #[must_use]
    pub fn with_hot_path(mut self, hot_path: HotPathConfig) -> Self {
        self.hot_path = hot_path;
        self
    }

    /// Set background comparison settings
    #[must_use]
    pub fn with_shadow(mut self, shadow: ShadowConfig) -> Self {
        self.shadow = shadow;
        self
    }

    /// Set audit settings
    #[must_use]
    pub fn with_audit(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }

    /// Set the per-request deadline
    #[must_use]
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = Some(timeout_ms);
        self
    }

    /// Check every setting is in range
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.confidence.validate()?;
        if self.routing.canary_percent > 100 {
            return Err(invalid(
                "routing.canary_percent",
                format!("must be at most 100, got {}", self.routing.canary_percent),
            ));
        }
        let rate = self.routing.optimized_sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(invalid(
                "routing.optimized_sample_rate",
                format!("must be within [0, 1], got {rate}"),
            ));
        }
        let eps = self.compare.epsilon;
        if !(eps.is_finite() && eps >= 0.0) {
            return Err(invalid(
                "compare.epsilon",
                format!("must be non-negative, got {eps}"),
            ));
        }
        if self.hot_path.enabled && self.hot_path.threshold == 0 {
            return Err(invalid("hot_path.threshold", "must be positive".to_string()));
        }
        if self.shadow.max_in_flight == 0 {
            return Err(invalid("shadow.max_in_flight", "must be positive".to_string()));
        }
        if self.audit.channel_capacity == 0 {
            return Err(invalid("audit.channel_capacity", "must be positive".to_string()));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(invalid("request_timeout_ms", "must be positive".to_string()));
        }
        Ok(())
    }

    /// Parse and validate JSON
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON or an out-of-range setting
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is invalid
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Load the file named by `TWINPATH_CONFIG`, or defaults when unset
    ///
    /// # Errors
    ///
    /// Returns error if the named file cannot be loaded
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_value(std::env::var_os(CONFIG_ENV).as_deref().map(Path::new))
    }

    fn from_env_value(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

//! Capability types for capability-based call authorization.
//!
//! A capability is a dotted name such as `db.read` or `payments.charge`.
//! Grants may use a trailing `.*` to cover a whole namespace, or `*` alone
//! to cover everything. Required capabilities are always concrete names.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A capability names a permission a node may need at execution time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    /// Parse a capability name
    ///
    /// # Errors
    ///
    /// Returns error if a segment is empty or contains characters outside
    /// `[a-z0-9_-]`, or if `*` appears anywhere but as the final segment
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        if name == "*" {
            return Ok(Self(name));
        }

        let segments: Vec<&str> = name.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(CoreError::InvalidCapability {
                    reason: format!("empty segment in {:?}", name),
                });
            }
            if *segment == "*" {
                if i + 1 != segments.len() {
                    return Err(CoreError::InvalidCapability {
                        reason: format!("wildcard must be the last segment in {:?}", name),
                    });
                }
                continue;
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
            {
                return Err(CoreError::InvalidCapability {
                    reason: format!("invalid segment {:?} in {:?}", segment, name),
                });
            }
        }

        Ok(Self(name))
    }

    /// Get the capability name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this capability is a wildcard grant
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == "*" || self.0.ends_with(".*")
    }

    /// Check whether this (granted) capability covers a required one
    #[must_use]
    pub fn covers(&self, required: &Capability) -> bool {
        if self.0 == "*" {
            return true;
        }
        match self.0.strip_suffix(".*") {
            Some(prefix) => {
                required.0.len() > prefix.len()
                    && required.0.starts_with(prefix)
                    && required.0.as_bytes()[prefix.len()] == b'.'
            }
            None => self.0 == required.0,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Capability {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Capability {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.0
    }
}

/// A set of capabilities, either granted to a caller or declared by a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Create a new empty capability set
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: BTreeSet::new(),
        }
    }

    /// Parse a set from capability names
    ///
    /// # Errors
    ///
    /// Returns error if any name is invalid
    pub fn parse<I, S>(names: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for name in names {
            set.grant(Capability::new(name)?);
        }
        Ok(set)
    }

    /// Grant a capability
    pub fn grant(&mut self, capability: Capability) {
        self.capabilities.insert(capability);
    }

    /// Check if a specific capability is present (exact match)
    #[must_use]
    pub fn has(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Check if a capability is allowed (exact or wildcard match)
    #[must_use]
    pub fn allows(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
            || self
                .capabilities
                .iter()
                .filter(|cap| cap.is_wildcard())
                .any(|cap| cap.covers(capability))
    }

    /// First capability of `required` (in sorted order) this set does not allow
    #[must_use]
    pub fn first_missing<'a>(&self, required: &'a CapabilitySet) -> Option<&'a Capability> {
        required.iter().find(|cap| !self.allows(cap))
    }

    /// Capabilities present in both sets (exact match)
    #[must_use]
    pub fn intersection(&self, other: &CapabilitySet) -> Vec<Capability> {
        self.capabilities
            .intersection(&other.capabilities)
            .cloned()
            .collect()
    }

    /// Get the number of capabilities
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Iterate over capabilities in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

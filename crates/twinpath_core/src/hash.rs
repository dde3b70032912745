//! Canonical fingerprints of node inputs.
//!
//! Uses BLAKE3 over a self-delimiting encoding of [`Value`]s. Object keys are
//! visited in sorted order, so two inputs that differ only in field order
//! share a fingerprint.

use crate::error::CoreError;
use crate::id::NodeId;
use crate::value::{Fields, Value};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 fingerprint (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// The number of bytes in a fingerprint
    pub const LEN: usize = 32;

    /// Compute BLAKE3 hash of raw data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Fingerprint of a field set alone
    #[must_use]
    pub fn of_fields(fields: &Fields) -> Self {
        Fingerprinter::new().fields(fields).finish()
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns error if hex is invalid or not 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(hex).map_err(|e| CoreError::InvalidFingerprint {
            reason: e.to_string(),
        })?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::InvalidFingerprint {
                reason: format!("expected 32 bytes, got {}", bytes.len()),
            })?;
        Ok(Self(arr))
    }

    /// Stable bucket in `0..modulus` derived from the leading bytes
    ///
    /// Used for reproducible traffic partitioning: the same fingerprint
    /// always lands in the same bucket.
    #[must_use]
    pub fn bucket(&self, modulus: u64) -> u64 {
        if modulus == 0 {
            return 0;
        }
        let mut lead = [0u8; 8];
        lead.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(lead) % modulus
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Incremental builder for fingerprints
///
/// Every component is tagged and length-prefixed, so distinct component
/// sequences cannot collide by concatenation.
pub struct Fingerprinter {
    hasher: blake3::Hasher,
}

impl Fingerprinter {
    /// Start a new fingerprint
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    /// Mix in a node identifier
    #[must_use]
    pub fn node(mut self, node_id: &NodeId) -> Self {
        self.tag(b'N');
        self.bytes(node_id.as_str().as_bytes());
        self
    }

    /// Mix in a node version
    #[must_use]
    pub fn version(mut self, version: &Version) -> Self {
        self.tag(b'V');
        self.hasher.update(&version.major.to_le_bytes());
        self.hasher.update(&version.minor.to_le_bytes());
        self.hasher.update(&version.patch.to_le_bytes());
        self
    }

    /// Mix in an input field set
    #[must_use]
    pub fn fields(mut self, fields: &Fields) -> Self {
        self.tag(b'F');
        self.object(fields);
        self
    }

    /// Mix in an idempotency key, if any
    ///
    /// `None` contributes nothing, so an absent key degrades to an
    /// input-only fingerprint.
    #[must_use]
    pub fn key(mut self, key: Option<&str>) -> Self {
        if let Some(key) = key {
            self.tag(b'K');
            self.bytes(key.as_bytes());
        }
        self
    }

    /// Finish and return the fingerprint
    #[must_use]
    pub fn finish(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }

    fn tag(&mut self, tag: u8) {
        self.hasher.update(&[tag]);
    }

    fn len(&mut self, len: usize) {
        self.hasher.update(&(len as u64).to_le_bytes());
    }

    fn bytes(&mut self, data: &[u8]) {
        self.len(data.len());
        self.hasher.update(data);
    }

    fn object(&mut self, fields: &Fields) {
        self.len(fields.len());
        for (key, value) in fields {
            self.bytes(key.as_bytes());
            self.value(value);
        }
    }

    fn value(&mut self, value: &Value) {
        match value {
            Value::Null => self.tag(0),
            Value::Bool(b) => {
                self.tag(1);
                self.hasher.update(&[u8::from(*b)]);
            }
            Value::Int(i) => {
                self.tag(2);
                self.hasher.update(&i.to_le_bytes());
            }
            Value::Float(f) => {
                self.tag(3);
                self.hasher.update(&canonical_float_bits(*f).to_le_bytes());
            }
            Value::Decimal(d) => {
                self.tag(4);
                self.hasher.update(&d.mantissa().to_le_bytes());
                self.hasher.update(&d.scale().to_le_bytes());
            }
            Value::String(s) => {
                self.tag(5);
                self.bytes(s.as_bytes());
            }
            Value::Array(items) => {
                self.tag(6);
                self.len(items.len());
                for item in items {
                    self.value(item);
                }
            }
            Value::Object(fields) => {
                self.tag(7);
                self.object(fields);
            }
        }
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse `-0.0` onto `0.0` and every NaN onto one payload
fn canonical_float_bits(f: f64) -> u64 {
    if f.is_nan() {
        f64::NAN.to_bits()
    } else if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}

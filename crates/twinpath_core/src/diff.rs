//! Structural differences between two results.
//!
//! Only the data types live here; the comparison itself is in
//! `twinpath_verify`.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a single difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    /// One side succeeded and the other reported an error
    TagMismatch,
    /// Both reported errors with different codes
    ErrorCodeMismatch,
    /// Values of incompatible types
    TypeMismatch,
    /// Null on exactly one side
    NullMismatch,
    /// Unequal booleans or strings
    ValueMismatch,
    /// Numbers outside the tolerance
    NumericMismatch,
    /// NaN on exactly one side
    NanMismatch,
    /// Infinities of opposite sign, or infinity against a finite number
    InfinitySignMismatch,
    /// Decimals with different mantissa or scale
    DecimalMismatch,
    /// Arrays of different lengths
    LengthMismatch,
    /// Key present only in the optimized result
    MissingInReference,
    /// Key present only in the reference result
    MissingInOptimized,
    /// Timestamps further apart than the tolerance
    TimestampMismatch,
}

impl DifferenceKind {
    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TagMismatch => "tag_mismatch",
            Self::ErrorCodeMismatch => "error_code_mismatch",
            Self::TypeMismatch => "type_mismatch",
            Self::NullMismatch => "null_mismatch",
            Self::ValueMismatch => "value_mismatch",
            Self::NumericMismatch => "numeric_mismatch",
            Self::NanMismatch => "nan_mismatch",
            Self::InfinitySignMismatch => "infinity_sign_mismatch",
            Self::DecimalMismatch => "decimal_mismatch",
            Self::LengthMismatch => "length_mismatch",
            Self::MissingInReference => "missing_in_reference",
            Self::MissingInOptimized => "missing_in_optimized",
            Self::TimestampMismatch => "timestamp_mismatch",
        }
    }
}

impl fmt::Display for DifferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One difference at a path such as `root.items[2].price`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difference {
    /// Difference category
    pub kind: DifferenceKind,
    /// Location inside the result
    pub path: String,
    /// Value on the reference side, if present
    pub reference: Option<Value>,
    /// Value on the optimized side, if present
    pub optimized: Option<Value>,
}

impl Difference {
    /// Create a difference
    #[must_use]
    pub fn new(
        kind: DifferenceKind,
        path: impl Into<String>,
        reference: Option<Value>,
        optimized: Option<Value>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            reference,
            optimized,
        }
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: &Option<Value>| match v {
            Some(v) => v.to_json().to_string(),
            None => "<absent>".to_string(),
        };
        write!(
            f,
            "{} at {}: {} vs {}",
            self.kind,
            self.path,
            side(&self.reference),
            side(&self.optimized)
        )
    }
}

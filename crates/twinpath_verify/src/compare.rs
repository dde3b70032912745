//! Differential comparison of two backend outcomes.
//!
//! Equality is structural: the success/error tag, the error code, and every
//! field take part; error messages and key order do not. Integers compare
//! exactly, floats within a relative tolerance, decimals bit-for-bit.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use twinpath_core::{Difference, DifferenceKind, Fields, Outcome, Value};

/// Default relative tolerance for float comparison
pub const DEFAULT_EPSILON: f64 = 1e-9;

/// Declared type of a top-level output field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// No declared constraint
    Any,
    /// Boolean
    Bool,
    /// Integer
    Int,
    /// Binary float
    Float,
    /// Exact decimal; never compared with tolerance
    Decimal,
    /// String
    String,
    /// RFC 3339 timestamp string
    Timestamp,
    /// List
    Array,
    /// Nested object
    Object,
}

/// Declared output shape: top-level field name to kind
pub type OutputShape = BTreeMap<String, FieldKind>;

/// Comparator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    /// Relative float tolerance
    pub epsilon: f64,
    /// Accept RFC 3339 timestamps this far apart; off when `None`
    pub timestamp_tolerance_ms: Option<u64>,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            timestamp_tolerance_ms: None,
        }
    }
}

impl CompareConfig {
    /// Set the float tolerance
    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Enable timestamp tolerance
    #[must_use]
    pub fn with_timestamp_tolerance_ms(mut self, tolerance: u64) -> Self {
        self.timestamp_tolerance_ms = Some(tolerance);
        self
    }
}

/// Structural comparator for backend outcomes
#[derive(Debug, Clone, Default)]
pub struct Comparator {
    config: CompareConfig,
}

impl Comparator {
    /// Create a comparator
    #[must_use]
    pub fn new(config: CompareConfig) -> Self {
        Self { config }
    }

    /// Current settings
    #[must_use]
    pub fn config(&self) -> &CompareConfig {
        &self.config
    }

    /// Whether the two outcomes diverge, with no declared shape
    #[must_use]
    pub fn compare(&self, reference: &Outcome, optimized: &Outcome) -> bool {
        !self.diff(reference, optimized, &OutputShape::new()).is_empty()
    }

    /// Whether the two outcomes diverge under a declared shape
    #[must_use]
    pub fn compare_shaped(&self, reference: &Outcome, optimized: &Outcome, shape: &OutputShape) -> bool {
        !self.diff(reference, optimized, shape).is_empty()
    }

    /// Every structural difference, in path order
    #[must_use]
    pub fn diff(&self, reference: &Outcome, optimized: &Outcome, shape: &OutputShape) -> Vec<Difference> {
        let mut out = Vec::new();
        match (reference, optimized) {
            (Outcome::Success { fields: a }, Outcome::Success { fields: b }) => {
                self.object(a, b, "root", Some(shape), &mut out);
            }
            (Outcome::Error(a), Outcome::Error(b)) => {
                if a.code != b.code {
                    out.push(Difference::new(
                        DifferenceKind::ErrorCodeMismatch,
                        "root.code",
                        Some(Value::String(a.code.clone())),
                        Some(Value::String(b.code.clone())),
                    ));
                }
                self.object(&a.fields, &b.fields, "root.fields", None, &mut out);
            }
            _ => out.push(Difference::new(
                DifferenceKind::TagMismatch,
                "root",
                Some(Value::from(reference.tag())),
                Some(Value::from(optimized.tag())),
            )),
        }
        out
    }

    fn object(
        &self,
        a: &Fields,
        b: &Fields,
        path: &str,
        shape: Option<&OutputShape>,
        out: &mut Vec<Difference>,
    ) {
        let mut left = a.iter().peekable();
        let mut right = b.iter().peekable();
        loop {
            let order = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((ka, _)), Some((kb, _))) => ka.cmp(kb),
            };
            match order {
                Ordering::Less => {
                    if let Some((key, value)) = left.next() {
                        out.push(Difference::new(
                            DifferenceKind::MissingInOptimized,
                            format!("{}.{}", path, key),
                            Some(value.clone()),
                            None,
                        ));
                    }
                }
                Ordering::Greater => {
                    if let Some((key, value)) = right.next() {
                        out.push(Difference::new(
                            DifferenceKind::MissingInReference,
                            format!("{}.{}", path, key),
                            None,
                            Some(value.clone()),
                        ));
                    }
                }
                Ordering::Equal => {
                    if let (Some((key, va)), Some((_, vb))) = (left.next(), right.next()) {
                        let kind = shape.and_then(|s| s.get(key)).copied();
                        self.value(va, vb, &format!("{}.{}", path, key), kind, out);
                    }
                }
            }
        }
    }

    fn value(&self, a: &Value, b: &Value, path: &str, kind: Option<FieldKind>, out: &mut Vec<Difference>) {
        let mismatch = |kind: DifferenceKind| {
            Difference::new(kind, path, Some(a.clone()), Some(b.clone()))
        };

        match (a, b) {
            (Value::Null, Value::Null) => {}
            (Value::Null, _) | (_, Value::Null) => out.push(mismatch(DifferenceKind::NullMismatch)),

            _ if kind == Some(FieldKind::Decimal) => match (a, b) {
                (Value::Decimal(x), Value::Decimal(y)) => {
                    if x != y {
                        out.push(mismatch(DifferenceKind::DecimalMismatch));
                    }
                }
                _ => out.push(mismatch(DifferenceKind::TypeMismatch)),
            },

            (Value::Int(x), Value::Int(y)) => {
                if x != y {
                    out.push(mismatch(DifferenceKind::NumericMismatch));
                }
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                    if let Some(kind) = self.float_mismatch(x, y) {
                        out.push(mismatch(kind));
                    }
                }
            }
            (Value::Decimal(x), Value::Decimal(y)) => {
                if x != y {
                    out.push(mismatch(DifferenceKind::DecimalMismatch));
                }
            }
            (Value::Bool(x), Value::Bool(y)) => {
                if x != y {
                    out.push(mismatch(DifferenceKind::ValueMismatch));
                }
            }
            (Value::String(x), Value::String(y)) => {
                if x == y {
                    return;
                }
                let timestamp_hint = matches!(kind, None | Some(FieldKind::Any | FieldKind::Timestamp));
                match self.config.timestamp_tolerance_ms {
                    Some(tolerance) if timestamp_hint => match timestamp_gap_ms(x, y) {
                        Some(gap) if gap <= tolerance => {}
                        Some(_) => out.push(mismatch(DifferenceKind::TimestampMismatch)),
                        None => out.push(mismatch(DifferenceKind::ValueMismatch)),
                    },
                    _ => out.push(mismatch(DifferenceKind::ValueMismatch)),
                }
            }
            (Value::Array(xs), Value::Array(ys)) => {
                if xs.len() != ys.len() {
                    out.push(Difference::new(
                        DifferenceKind::LengthMismatch,
                        path,
                        Some(Value::Int(i64::try_from(xs.len()).unwrap_or(i64::MAX))),
                        Some(Value::Int(i64::try_from(ys.len()).unwrap_or(i64::MAX))),
                    ));
                }
                for (i, (x, y)) in xs.iter().zip(ys).enumerate() {
                    self.value(x, y, &format!("{}[{}]", path, i), None, out);
                }
            }
            (Value::Object(x), Value::Object(y)) => self.object(x, y, path, None, out),
            _ => out.push(mismatch(DifferenceKind::TypeMismatch)),
        }
    }

    fn float_mismatch(&self, x: f64, y: f64) -> Option<DifferenceKind> {
        match (x.is_nan(), y.is_nan()) {
            (true, true) => return None,
            (true, false) | (false, true) => return Some(DifferenceKind::NanMismatch),
            (false, false) => {}
        }
        if x.is_infinite() || y.is_infinite() {
            return if x == y {
                None
            } else {
                Some(DifferenceKind::InfinitySignMismatch)
            };
        }
        let scale = 1.0f64.max(x.abs()).max(y.abs());
        if (x - y).abs() <= self.config.epsilon * scale {
            None
        } else {
            Some(DifferenceKind::NumericMismatch)
        }
    }
}

fn timestamp_gap_ms(a: &str, b: &str) -> Option<u64> {
    let a = DateTime::parse_from_rfc3339(a).ok()?;
    let b = DateTime::parse_from_rfc3339(b).ok()?;
    Some((a - b).num_milliseconds().unsigned_abs())
}

//! # Scalar
//!
//! The value type stored in an indexes record, and the sortable binary
//! encoding used for secondary keys.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length, in bytes, of an encoded scalar value. Values over this
/// are rejected with `Error::BadIndexValue` at write time.
pub const MAX_ENCODED_LEN: usize = 1024;

/// A value that may appear in an item's indexes map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// A boolean index value.
    Bool(bool),
    /// A numeric index value. Integers and finite floats share this
    /// variant; both reduce to the same canonical sortable encoding.
    Number(f64),
    /// A string index value. Must not contain the `\0` byte.
    Text(String),
}

impl Scalar {
    /// Type tag byte used as the first byte of the encoded form, so that
    /// values of different types sort by type first (bool < number < text)
    /// rather than colliding. Mixing types under one property is
    /// implementation-defined; the tag just keeps the ordering deterministic
    /// instead of producing a parse ambiguity.
    const fn type_tag(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Number(_) => 1,
            Self::Text(_) => 2,
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        Self::Number(v as f64)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Encode a number as an order-preserving 16-byte big-endian value: the
/// classic IEEE-754 monotonic double trick (flip the sign bit for
/// non-negatives, flip every bit for negatives) so byte-lex order equals
/// numeric order across negatives, zero, and positives, zero-padded on the
/// left to a 16-byte width, leaving room to widen to a bignum or
/// fixed-point encoding later without reordering existing keys.
fn encode_number(n: f64) -> Result<[u8; 16]> {
    if !n.is_finite() {
        return Err(Error::BadIndexValue(format!("non-finite number: {n}")));
    }
    let bits = n.to_bits();
    let flipped = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    let mut out = [0u8; 16];
    out[8..].copy_from_slice(&flipped.to_be_bytes());
    Ok(out)
}

/// Encode a scalar into its sortable binary form, prefixed
/// with a one-byte type tag. Rejects values that would make byte-lex order
/// diverge from natural order, or that exceed `MAX_ENCODED_LEN`.
pub fn encode_scalar(value: &Scalar) -> Result<Vec<u8>> {
    let mut out = vec![value.type_tag()];
    match value {
        Scalar::Bool(b) => out.push(u8::from(*b)),
        Scalar::Number(n) => out.extend_from_slice(&encode_number(*n)?),
        Scalar::Text(s) => {
            if s.contains('\0') {
                return Err(Error::BadIndexValue("string values may not contain \\0".into()));
            }
            out.extend_from_slice(s.as_bytes());
        }
    }
    if out.len() > MAX_ENCODED_LEN {
        return Err(Error::BadIndexValue(format!(
            "encoded value exceeds {MAX_ENCODED_LEN} bytes"
        )));
    }
    Ok(out)
}

/// Compare two scalars by their sortable encoding. Used for cursor
/// comparisons and in-memory range filtering; cheaper call sites that
/// already have the encoded bytes should compare those directly instead.
pub fn compare(a: &Scalar, b: &Scalar) -> std::cmp::Ordering {
    // encode_scalar only fails on non-finite numbers or unrepresentable
    // strings, neither of which can occur here because both a and b were
    // already accepted by the index at write time.
    let ea = encode_scalar(a).unwrap_or_default();
    let eb = encode_scalar(b).unwrap_or_default();
    ea.cmp(&eb)
}

/// Validate an index property name: non-empty, no `\0`.
pub fn validate_property(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BadIndexValue("property name must not be empty".into()));
    }
    if name.contains('\0') {
        return Err(Error::BadIndexValue(format!("property name {name:?} contains \\0")));
    }
    Ok(())
}

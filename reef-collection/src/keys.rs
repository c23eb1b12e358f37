//! Key encoding per index kind.
//!
//! Index keys are compared as raw bytes, so every kind is encoded such
//! that byte order equals the kind's natural order: strings and byte
//! strings are stored as-is, numbers as fixed-width big-endian with the
//! sign bit flipped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Longest accepted key, in bytes. Matches the directory name bound of the
/// tree layer above.
pub const MAX_KEY_LEN: usize = 100;

/// The kinds of values an index column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// UTF-8 string keys, ordered lexicographically.
    String,
    /// Signed 64-bit integer keys, ordered numerically.
    Number,
    /// Raw byte-string keys, ordered lexicographically. No encoding.
    Bytes,
    /// Object-valued columns; one index entry per object key.
    Map,
    /// Array-valued columns; one index entry per element.
    List,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexKind::String => "string",
            IndexKind::Number => "number",
            IndexKind::Bytes => "bytes",
            IndexKind::Map => "map",
            IndexKind::List => "list",
        };
        write!(f, "{name}")
    }
}

/// Check a key against the length bounds shared by every kind.
pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid("empty key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid(format!(
            "key longer than {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

/// Encode a number key. Flipping the sign bit turns two's complement into
/// an offset representation whose big-endian bytes sort numerically.
pub(crate) fn encode_number(n: i64) -> [u8; 8] {
    ((n as u64) ^ (1 << 63)).to_be_bytes()
}

/// Decode a number key.
pub(crate) fn decode_number(key: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Corrupt("number key of wrong width"))?;
    Ok((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64)
}

/// Encode a JSON number as an index key. The index only orders integers;
/// non-finite or fractional inputs are rejected.
pub(crate) fn encode_json_number(v: f64) -> Result<[u8; 8]> {
    if !v.is_finite() {
        return Err(Error::invalid("number key must be finite"));
    }
    if v.fract() != 0.0 {
        return Err(Error::invalid("number key must be an integer"));
    }
    if v < i64::MIN as f64 || v >= i64::MAX as f64 + 1.0 {
        return Err(Error::invalid("number key out of range"));
    }
    Ok(encode_number(v as i64))
}

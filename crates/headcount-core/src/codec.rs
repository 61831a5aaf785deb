//! Storable byte form of a [`FeatureVector`].
//!
//! Layout (version 1), all little-endian:
//!
//! ```text
//! magic "HCFV" | version:u8 | len:u32 | len × f32 (IEEE-754 bits)
//! ```
//!
//! Decoding is bit-exact: `decode(&encode(v)) == v` for every vector,
//! including signed zeros.

use crate::types::FeatureVector;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"HCFV";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("blob too short for header: {0} bytes")]
    Truncated(usize),
    #[error("bad magic: not an encoded feature vector")]
    BadMagic,
    #[error("unsupported feature vector format version {0}")]
    UnsupportedVersion(u8),
    #[error("length prefix says {expected} values, payload holds {actual} bytes")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("feature vector contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Encode a feature vector into its versioned byte form.
pub fn encode(vector: &FeatureVector) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + vector.len() * 4);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for v in &vector.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a blob produced by [`encode`].
pub fn decode(blob: &[u8]) -> Result<FeatureVector, CodecError> {
    if blob.len() < HEADER_LEN {
        return Err(CodecError::Truncated(blob.len()));
    }
    if &blob[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = blob[4];
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let len = u32::from_le_bytes([blob[5], blob[6], blob[7], blob[8]]) as usize;
    let payload = &blob[HEADER_LEN..];
    if payload.len() != len.saturating_mul(4) {
        return Err(CodecError::LengthMismatch {
            expected: len,
            actual: payload.len(),
        });
    }

    let mut values = Vec::with_capacity(len);
    for (i, chunk) in payload.chunks_exact(4).enumerate() {
        let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !v.is_finite() {
            return Err(CodecError::NonFinite(i));
        }
        values.push(v);
    }

    Ok(FeatureVector::new(values))
}

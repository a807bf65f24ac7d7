use qcal_core::errors::CalError;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::serde::to_canonical_json_bytes;

/// SHA-256 of the canonical JSON form of `value`, as lowercase hex.
///
/// Run reports record these for the scheme, the template library and the
/// initial assumptions, so two reports with equal hashes ran the same inputs
/// regardless of file formatting or key order.
pub fn stable_hash_string<T: Serialize>(value: &T) -> Result<String, CalError> {
    let bytes = to_canonical_json_bytes(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{:x}", digest))
}

//! xxHash-based fingerprints of compiled queries.
//!
//! A fingerprint is a deterministic 64-bit hash over the serialized shape of
//! a compiled query (SQL AST, read plan, post-processing mode and external
//! value list). Translating the same expression twice yields the same
//! fingerprint, so callers can use it as a cache or statement-name key.

use serde::Serialize;
use xxhash_rust::xxh64;

use crate::error::TranslateError;

/// Fixed seed for deterministic hashing.
pub const SEED: u64 = 0x517cc1b727220a95;

/// Fingerprint any serializable value through its JSON form.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<u64, TranslateError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| TranslateError::InternalError(format!("fingerprint serialization: {e}")))?;
    Ok(xxh64::xxh64(&bytes, SEED))
}

//! BP-007: BLAKE3 blueprint fingerprints.
//!
//! A fingerprint is the hash of the blueprint's canonical YAML, so two
//! models that export identically share a fingerprint. Provenance tags are
//! not part of the YAML and do not affect it.

use super::parser::to_yaml;
use super::types::Blueprint;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Fingerprint of a blueprint model.
pub fn fingerprint(bp: &Blueprint) -> Result<String, String> {
    to_yaml(bp).map(|yaml| hash_string(&yaml))
}

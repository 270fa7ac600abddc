//! Content hashing for staleness versions.
//!
//! Hashes are SHA-256 over the canonical JSON rendering of a value. Object
//! keys are emitted in sorted order, so two structurally equal values always
//! hash the same.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex-encoded SHA-256 of the canonical JSON form of `value`.
///
/// # Errors
///
/// Returns an error if `value` cannot be converted to JSON.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(value)?;
    let rendered = serde_json::to_vec(&canonical)?;
    Ok(sha256_hex(&rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let mut a = HashMap::new();
        a.insert("model", json!("gpt"));
        a.insert("temperature", json!(0.2));
        let b = json!({"temperature": 0.2, "model": "gpt"});

        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_content_hash_detects_change() {
        let a = json!({"prompt": "summarize"});
        let b = json!({"prompt": "translate"});
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }
}

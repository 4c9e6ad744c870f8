//! Hashing primitives for the chain and drug verification
//!
//! This module provides:
//! - SHA-256 hex digests
//! - Canonical JSON (recursively sorted keys, no whitespace) for hashing
//! - Drug verification hashes

use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of `data`, lowercase hex encoded
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(hash_bytes(data))
}

/// Serialize a value to canonical JSON
///
/// Object keys are sorted at every depth so the output does not depend on
/// field declaration order or map insertion order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&canonicalize(value))?)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Timestamp encoding used inside hashed material
pub fn hash_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Verification hash binding a drug to its manufacturer and creation time
pub fn verification_hash(drug_id: &str, manufacturer_id: &str, created_at: &DateTime<Utc>) -> String {
    let material = format!(
        "{}:{}:{}",
        drug_id,
        manufacturer_id,
        created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    sha256_hex(material.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [ {"d": 1, "c": 2} ]}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"y":[{"c":2,"d":1}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_verification_hash_deterministic() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let h1 = verification_hash("D1", "M1", &ts);
        let h2 = verification_hash("D1", "M1", &ts);
        assert_eq!(h1, h2);
        assert_eq!(h1, sha256_hex(b"D1:M1:2024-03-01T12:00:00Z"));
        assert_ne!(h1, verification_hash("D2", "M1", &ts));
    }
}

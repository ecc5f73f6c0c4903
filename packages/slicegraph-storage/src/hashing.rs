//! Determinism utilities
//!
//! Every content hash in the pipeline goes through this module so that the
//! same logical payload always produces the same digest:
//!
//! - `canonicalize`: recursively sorts object keys
//! - `canonical_string`: compact serialization (no whitespace)
//! - `raw_content_hash` / `slice_content_hash` / `tombstone_hash`: SHA-256 hex digests
//!
//! `serde_json::Map` is a `BTreeMap` without the `preserve_order` feature, but
//! `canonicalize` does not rely on that and rebuilds every object explicitly.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively sort object keys. Arrays keep their order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact canonical JSON text of `value`.
pub fn canonical_string(value: &Value) -> String {
    let canonical = canonicalize(value);
    // Serializing a Value cannot fail (all keys are strings)
    serde_json::to_string(&canonical).unwrap_or_default()
}

/// Compute SHA256 hash of bytes as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `sha256(canonical(payload) | schemaId | schemaVersion)`
pub fn raw_content_hash(payload: &Value, schema_id: &str, schema_version: &str) -> String {
    let material = format!(
        "{}|{}|{}",
        canonical_string(payload),
        schema_id,
        schema_version
    );
    sha256_hex(material.as_bytes())
}

/// Slice hashes depend on the data alone.
pub fn slice_content_hash(data: &Value) -> String {
    sha256_hex(canonical_string(data).as_bytes())
}

/// `sha256("TOMBSTONE:" + entityKey + ":" + type + ":v" + version)`
pub fn tombstone_hash(entity_key: &str, slice_type: &str, version: u64) -> String {
    let material = format!("TOMBSTONE:{}:{}:v{}", entity_key, slice_type, version);
    sha256_hex(material.as_bytes())
}

/// Lookup-stable form of an inverted index value.
pub fn normalize_index_value(value: &str) -> String {
    value.trim().to_lowercase()
}

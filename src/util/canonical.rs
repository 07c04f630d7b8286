//! Canonical JSON re-serialization.
//!
//! The signing-service wallet-auth header hashes the request body, and the
//! service computes the same hash over a canonical form of the JSON: object
//! keys sorted lexicographically at every depth, arrays kept in order,
//! scalars unchanged.

use serde_json::{Map, Value};

/// Returns a copy of `value` with all object keys sorted recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Re-serializes JSON bytes in canonical form.
///
/// Input that does not parse as JSON is returned unchanged, matching the
/// behavior the signing service applies on its side.
pub fn canonicalize_bytes(data: &[u8]) -> Vec<u8> {
    let value: Value = match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(_) => return data.to_vec(),
    };
    serde_json::to_vec(&canonicalize(&value)).unwrap_or_else(|_| data.to_vec())
}

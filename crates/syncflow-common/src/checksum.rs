//! Checksum utilities for content change detection
//!
//! Records are compared across runs by the SHA-256 of their canonical JSON
//! form: object keys sorted at every level, so two payloads that differ only
//! in key order hash identically whatever map ordering `serde_json` is built
//! with.

use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 of a byte slice
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the hex SHA-256 of a value's canonical JSON encoding
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = canonicalize(serde_json::to_value(value)?);
    let encoded = serde_json::to_vec(&canonical)?;
    Ok(hash_bytes(&encoded))
}

/// Rebuild every object with its keys in sorted order
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        },
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_bytes_known_vector() {
        assert_eq!(
            hash_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_json_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":[1,2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":[1,2],"a":1}"#).unwrap();
        assert_eq!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
    }

    #[test]
    fn test_canonical_form_sorts_nested_keys() {
        let mut inner = serde_json::Map::new();
        inner.insert("z".into(), Value::from(1));
        inner.insert("m".into(), Value::from(2));
        let mut outer = serde_json::Map::new();
        outer.insert("list".into(), Value::Array(vec![Value::Object(inner)]));
        outer.insert("id".into(), Value::from("t1"));

        let canonical = serde_json::to_string(&canonicalize(Value::Object(outer.clone()))).unwrap();
        assert_eq!(canonical, r#"{"id":"t1","list":[{"m":2,"z":1}]}"#);
        assert_eq!(hash_json(&Value::Object(outer)).unwrap(), hash_bytes(canonical.as_bytes()));
    }

    proptest! {
        #[test]
        fn prop_distinct_strings_hash_differently(a in ".{0,32}", b in ".{0,32}") {
            prop_assume!(a != b);
            prop_assert_ne!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
        }
    }
}

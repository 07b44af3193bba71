/*
    canonical.rs - Deterministic JSON and value fingerprints

    The set variant keys entries by a fingerprint of their value, and the
    signer signs canonical bytes, so two replicas must agree byte-for-byte
    on the stringification of any value:

    - object keys are sorted (serde_json's map type is a BTreeMap, so
      re-encoding through Value orders keys; asserted by test)
    - numbers use serde_json's shortest-roundtrip formatting
    - non-finite floats are unrepresentable (serde_json::Number)

    The fingerprint is the 128-bit murmur3 (x64 variant, seed 0) of the
    canonical bytes, rendered as 32 lowercase hex characters.
*/

use crate::error::MapResult;
use serde::Serialize;
use std::io::Cursor;

/// Number of hex characters in a fingerprint
pub const FINGERPRINT_LENGTH: usize = 32;

/// Canonical JSON stringification of any serializable value
pub fn canonical_json<V: Serialize>(value: &V) -> MapResult<String> {
    // Round-tripping through Value sorts object keys regardless of the
    // field order the type serializes with
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// Fingerprint a value: returns (hash, canonical form)
pub fn fingerprint<V: Serialize>(value: &V) -> MapResult<(String, String)> {
    let canonical = canonical_json(value)?;
    let hash = fingerprint_of_canonical(&canonical)?;
    Ok((hash, canonical))
}

/// Fingerprint an already-canonical string
pub fn fingerprint_of_canonical(canonical: &str) -> MapResult<String> {
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(canonical.as_bytes()), 0)?;
    Ok(format!("{hash:032x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[test]
    fn test_object_keys_are_sorted() {
        #[derive(Serialize)]
        struct Unordered {
            zebra: u32,
            apple: u32,
            mango: u32,
        }

        let canonical = canonical_json(&Unordered { zebra: 1, apple: 2, mango: 3 }).unwrap();
        assert_eq!(canonical, r#"{"apple":2,"mango":3,"zebra":1}"#);
    }

    #[test]
    fn test_nested_objects_are_sorted() {
        let value = json!({"b": {"d": 1, "c": 2}, "a": [{"y": 0, "x": 0}]});
        let canonical = canonical_json(&value).unwrap();
        assert_eq!(canonical, r#"{"a":[{"x":0,"y":0}],"b":{"c":2,"d":1}}"#);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let value = json!({"name": "alice", "age": 30});
        let (first, canonical) = fingerprint(&value).unwrap();
        let (second, _) = fingerprint(&value).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), FINGERPRINT_LENGTH);
        assert_eq!(first, fingerprint_of_canonical(&canonical).unwrap());
    }

    #[test]
    fn test_fingerprint_ignores_field_order() {
        let a = json!({"x": 1, "y": 2});
        let b = serde_json::from_str::<serde_json::Value>(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(fingerprint(&a).unwrap().0, fingerprint(&b).unwrap().0);
    }

    #[test]
    fn test_different_values_fingerprint_differently() {
        let (a, _) = fingerprint(&json!([1, 2, 3])).unwrap();
        let (b, _) = fingerprint(&json!([1, 2, 4])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_scalars_have_canonical_forms() {
        assert_eq!(canonical_json(&42u32).unwrap(), "42");
        assert_eq!(canonical_json(&true).unwrap(), "true");
        assert_eq!(canonical_json(&"hi").unwrap(), "\"hi\"");
        assert_eq!(canonical_json(&1.5f64).unwrap(), "1.5");
    }
}

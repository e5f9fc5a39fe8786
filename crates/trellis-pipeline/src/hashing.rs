//! Canonical JSON and digests used for definition fingerprints.

use serde_json::Value;
use std::collections::BTreeMap;

use trellis_types::Fingerprint;

/// Bumped whenever the fingerprint input layout changes, so every cached
/// artifact from an older layout is seen as changed.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Serialize with object keys sorted at every level and no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(_) => value.to_string(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let tree: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, to_canonical_json(v))).collect();
            let items: Vec<String> = tree
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// Hex blake3 digest of a string.
pub fn hash_str(input: &str) -> String {
    let mut h = blake3::Hasher::new();
    h.update(input.as_bytes());
    h.finalize().to_hex().to_string()
}

pub fn fingerprint_value(value: &Value) -> Fingerprint {
    Fingerprint::from_hex(hash_str(&to_canonical_json(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "y": null}});
        assert_eq!(to_canonical_json(&v), r#"{"a":{"y":null,"z":true},"b":1}"#);
    }

    #[test]
    fn arrays_keep_order() {
        let v = json!(["b", "a"]);
        assert_eq!(to_canonical_json(&v), r#"["b","a"]"#);
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!({"q": "say \"hi\""});
        assert_eq!(to_canonical_json(&v), r#"{"q":"say \"hi\""}"#);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut a = serde_json::Map::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = serde_json::Map::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));
        assert_eq!(
            fingerprint_value(&Value::Object(a)),
            fingerprint_value(&Value::Object(b))
        );
    }

    #[test]
    fn digest_is_hex_blake3() {
        let h = hash_str("trellis");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(h, hash_str("trellis "));
    }
}

//! Canonical JSON serialization and SHA-256 content hashing.
//!
//! Canonical form sorts object keys recursively and emits no whitespace, so
//! two logically identical payloads always serialize (and hash) identically
//! regardless of the key order they were built with. Array order is
//! significant and preserved.
//!
//! Keys are sorted explicitly rather than relying on `serde_json::Map`
//! ordering, which flips to insertion order when any crate in the build
//! enables `preserve_order`.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Lowercase hex SHA-256 of the canonical form of `value`.
pub fn content_hash(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "y": [3, {"d": null, "c": "x"}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":[3,{"c":"x","d":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn key_order_never_affects_hash() {
        let mut forward = serde_json::Map::new();
        forward.insert("capability".to_string(), json!("summarize"));
        forward.insert("input".to_string(), json!({"text": "hi", "lang": "en"}));

        let mut reversed = serde_json::Map::new();
        reversed.insert("input".to_string(), json!({"lang": "en", "text": "hi"}));
        reversed.insert("capability".to_string(), json!("summarize"));

        assert_eq!(
            content_hash(&Value::Object(forward)),
            content_hash(&Value::Object(reversed))
        );
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
    }

    #[test]
    fn escapes_strings_like_serde_json() {
        let value = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

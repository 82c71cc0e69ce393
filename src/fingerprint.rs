//! Record fingerprints for delta detection.

use crate::extract;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Separator between `key=value` pairs in keys-mode payloads.
const UNIT_SEPARATOR: char = '\u{1e}';

/// Render a JSON value in canonical form: object keys sorted, no whitespace.
/// Digests stay stable across equivalent encodings of the same document.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Digest of the full canonicalized record, scoped to the source.
pub fn digest_full_record(source: &str, record: &Value) -> Vec<u8> {
    let payload = format!("{}:{}", source, canonical_json(record));
    sha256(payload.as_bytes())
}

/// Digest over the configured key paths: `field1=value1␞field2=value2…`.
/// Paths that do not resolve contribute `null`.
pub fn digest_keys(source: &str, record: &Value, keys: &[String]) -> Vec<u8> {
    let mut payload = format!("{}:", source);
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            payload.push(UNIT_SEPARATOR);
        }
        payload.push_str(key);
        payload.push('=');
        match extract::lookup(record, None, key) {
            Some(value) => payload.push_str(&canonical_json(value)),
            None => payload.push_str("null"),
        }
    }
    sha256(payload.as_bytes())
}

fn sha256(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().to_vec()
}

/// Hex rendering used for key-value store keys and debug logging.
pub fn hex_digest(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

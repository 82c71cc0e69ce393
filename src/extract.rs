//! Path resolution against dynamic JSON payloads.
//!
//! Paths are dot-separated segments. A segment may carry a selector:
//! `name[3]` (index, negative counts from the end), `name[1:4]` (slice), or
//! `name[]` (expand: following segments apply to every element and results
//! flatten). `$root.` anchors a path at the response root instead of the
//! current record, and `/.` embeds a literal dot inside a key.
//!
//! Failing to resolve a segment yields "absent", which is distinct from a
//! JSON `null` value that was actually present in the payload.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("expected a list at segment '{segment}' but found {found}")]
    NotAList {
        segment: String,
        found: &'static str,
    },

    #[error("index {index} out of bounds at segment '{segment}'")]
    IndexOutOfBounds { index: i64, segment: String },

    #[error("invalid selector '{selector}' at segment '{segment}'")]
    InvalidSelector { selector: String, segment: String },

    #[error("root-scoped lookup requires an object payload")]
    RootNotObject,
}

/// Outcome of resolving a path.
#[derive(Debug, PartialEq)]
pub enum Resolved<'a> {
    /// Some segment failed to resolve.
    Absent,
    /// The path resolved to exactly one value and no `[]` expansion was used.
    One(&'a Value),
    /// The path used expansion; results are flattened in payload order.
    Many(Vec<&'a Value>),
}

#[derive(Debug, PartialEq)]
enum Selector {
    None,
    All,
    Index(i64),
    Slice(Option<i64>, Option<i64>),
}

struct Segment {
    name: String,
    selector: Selector,
}

const ROOT_PREFIX: &str = "$root.";

/// Split a path on `.` while honoring the `/.` literal-dot escape.
fn split_segments(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut chars = path.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '/' && chars.peek() == Some(&'.') {
            chars.next();
            buf.push('.');
        } else if ch == '.' {
            if !buf.is_empty() {
                parts.push(std::mem::take(&mut buf));
            }
        } else {
            buf.push(ch);
        }
    }
    if !buf.is_empty() {
        parts.push(buf);
    }
    parts
}

fn parse_segment(raw: &str) -> Result<Segment, ExtractError> {
    let Some(open) = raw.find('[') else {
        return Ok(Segment {
            name: raw.to_string(),
            selector: Selector::None,
        });
    };
    if !raw.ends_with(']') {
        return Err(ExtractError::InvalidSelector {
            selector: raw[open..].to_string(),
            segment: raw.to_string(),
        });
    }
    let name = raw[..open].to_string();
    let inner = &raw[open + 1..raw.len() - 1];
    let selector = if inner.is_empty() {
        Selector::All
    } else if let Some((lo, hi)) = inner.split_once(':') {
        let parse_bound = |s: &str| -> Result<Option<i64>, ExtractError> {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| ExtractError::InvalidSelector {
                    selector: inner.to_string(),
                    segment: name.clone(),
                })
            }
        };
        Selector::Slice(parse_bound(lo)?, parse_bound(hi)?)
    } else {
        Selector::Index(inner.parse().map_err(|_| ExtractError::InvalidSelector {
            selector: inner.to_string(),
            segment: name.clone(),
        })?)
    };
    Ok(Segment { name, selector })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn slice_bound(bound: Option<i64>, len: usize, default: usize) -> usize {
    match bound {
        None => default,
        Some(b) if b < 0 => len.saturating_sub(b.unsigned_abs() as usize),
        Some(b) => (b as usize).min(len),
    }
}

/// Resolve `path` against `data`. `root` is the response root, consulted for
/// `$root.`-anchored paths.
pub fn resolve<'a>(
    data: &'a Value,
    root: Option<&'a Value>,
    path: &str,
) -> Result<Resolved<'a>, ExtractError> {
    let (start, path) = if let Some(rest) = path.strip_prefix(ROOT_PREFIX) {
        match root {
            Some(r) if r.is_object() => (r, rest),
            _ => return Err(ExtractError::RootNotObject),
        }
    } else {
        (data, path)
    };

    let mut current: Vec<&'a Value> = vec![start];
    let mut expanded = false;

    for raw in split_segments(path) {
        let segment = parse_segment(&raw)?;
        let mut next: Vec<&'a Value> = Vec::new();
        for item in current {
            let Some(value) = item.get(&segment.name) else {
                continue;
            };
            match &segment.selector {
                Selector::None => next.push(value),
                Selector::All | Selector::Index(_) | Selector::Slice(..) => {
                    let Value::Array(elements) = value else {
                        return Err(ExtractError::NotAList {
                            segment: segment.name.clone(),
                            found: type_name(value),
                        });
                    };
                    match &segment.selector {
                        Selector::All => {
                            expanded = true;
                            next.extend(elements.iter());
                        }
                        Selector::Index(i) => {
                            let len = elements.len() as i64;
                            let idx = if *i < 0 { len + i } else { *i };
                            if idx < 0 || idx >= len {
                                return Err(ExtractError::IndexOutOfBounds {
                                    index: *i,
                                    segment: segment.name.clone(),
                                });
                            }
                            next.push(&elements[idx as usize]);
                        }
                        Selector::Slice(lo, hi) => {
                            expanded = true;
                            let len = elements.len();
                            let start = slice_bound(*lo, len, 0);
                            let end = slice_bound(*hi, len, len);
                            if start < end {
                                next.extend(elements[start..end].iter());
                            }
                        }
                        Selector::None => unreachable!(),
                    }
                }
            }
        }
        current = next;
        if current.is_empty() {
            return Ok(Resolved::Absent);
        }
    }

    if !expanded && current.len() == 1 {
        Ok(Resolved::One(current[0]))
    } else {
        Ok(Resolved::Many(current))
    }
}

/// Scalar lookup used by predicates, attributes, and metric readings.
///
/// Shape errors and `$root.` misuse count as absent here; when an expansion
/// yields a sequence the first element is taken.
pub fn lookup<'a>(data: &'a Value, root: Option<&'a Value>, path: &str) -> Option<&'a Value> {
    match resolve(data, root, path) {
        Ok(Resolved::One(v)) => Some(v),
        Ok(Resolved::Many(vs)) => vs.first().copied(),
        _ => None,
    }
}

/// Extract the record sequence from a response payload per `dataKey`.
///
/// Without a `dataKey` the payload itself is the sequence (an array yields
/// its elements, anything else a single record). With one, an unresolvable
/// path yields an empty sequence, a terminal array is flattened into the
/// sequence, and a terminal scalar or object becomes a single record.
pub fn extract_records(payload: &Value, data_key: Option<&str>) -> Result<Vec<Value>, ExtractError> {
    let data_key = data_key.filter(|k| !k.is_empty());
    let Some(path) = data_key else {
        return Ok(match payload {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        });
    };

    let resolved = resolve(payload, Some(payload), path)?;
    let items: Vec<&Value> = match resolved {
        Resolved::Absent => return Ok(Vec::new()),
        Resolved::One(v) => vec![v],
        Resolved::Many(vs) => vs,
    };

    let mut records = Vec::new();
    for item in items {
        match item {
            Value::Array(elements) => records.extend(elements.iter().cloned()),
            other => records.push(other.clone()),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_dotted_lookup() {
        let data = json!({"a": {"b": {"c": 42}}});
        assert_eq!(lookup(&data, None, "a.b.c"), Some(&json!(42)));
    }

    #[test]
    fn test_absent_is_distinct_from_null() {
        let data = json!({"a": null});
        assert_eq!(lookup(&data, None, "a"), Some(&Value::Null));
        assert_eq!(lookup(&data, None, "b"), None);
    }

    #[test]
    fn test_literal_dot_escape() {
        let data = json!({"a.b": {"c": 1}});
        assert_eq!(lookup(&data, None, "a/.b.c"), Some(&json!(1)));
    }

    #[test]
    fn test_root_anchor() {
        let record = json!({"id": 1});
        let root = json!({"meta": {"page": 3}, "items": [{"id": 1}]});
        assert_eq!(lookup(&record, Some(&root), "$root.meta.page"), Some(&json!(3)));
    }

    #[test]
    fn test_root_anchor_requires_object_payload() {
        let record = json!({"id": 1});
        let root = json!([1, 2]);
        assert!(matches!(
            resolve(&record, Some(&root), "$root.meta"),
            Err(ExtractError::RootNotObject)
        ));
    }

    #[test]
    fn test_index_and_negative_index() {
        let data = json!({"items": [{"v": 1}, {"v": 2}, {"v": 3}]});
        assert_eq!(lookup(&data, None, "items[0].v"), Some(&json!(1)));
        assert_eq!(lookup(&data, None, "items[-1].v"), Some(&json!(3)));
    }

    #[test]
    fn test_out_of_bounds_index_errors() {
        let data = json!({"items": [1]});
        assert!(matches!(
            resolve(&data, None, "items[5]"),
            Err(ExtractError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_expand_flattens_following_segments() {
        let data = json!({"groups": [
            {"members": [{"id": 1}, {"id": 2}]},
            {"members": [{"id": 3}]}
        ]});
        let Resolved::Many(values) = resolve(&data, None, "groups[].members[].id").unwrap() else {
            panic!("expected sequence");
        };
        let ids: Vec<i64> = values.iter().map(|v| v.as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_slice_selector() {
        let data = json!({"items": [10, 20, 30, 40]});
        let Resolved::Many(values) = resolve(&data, None, "items[1:3]").unwrap() else {
            panic!("expected sequence");
        };
        let nums: Vec<i64> = values.iter().map(|v| v.as_i64().unwrap()).collect();
        assert_eq!(nums, vec![20, 30]);
    }

    #[test]
    fn test_selector_on_non_list_errors() {
        let data = json!({"items": {"not": "a list"}});
        assert!(matches!(
            resolve(&data, None, "items[]"),
            Err(ExtractError::NotAList { .. })
        ));
    }

    #[test]
    fn test_extract_records_without_data_key() {
        let payload = json!([{"id": 1}, {"id": 2}]);
        let records = extract_records(&payload, None).unwrap();
        assert_eq!(records.len(), 2);

        let scalar = json!({"single": true});
        let records = extract_records(&scalar, None).unwrap();
        assert_eq!(records, vec![scalar]);
    }

    #[test]
    fn test_extract_records_absent_path_yields_empty() {
        let payload = json!({"data": []});
        let records = extract_records(&payload, Some("missing.path")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_extract_records_flattens_terminal_list() {
        let payload = json!({"data": {"items": [{"id": 1}, {"id": 2}]}});
        let records = extract_records(&payload, Some("data.items")).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_extract_records_wraps_terminal_object() {
        let payload = json!({"data": {"id": 7}});
        let records = extract_records(&payload, Some("data")).unwrap();
        assert_eq!(records, vec![json!({"id": 7})]);
    }

    #[test]
    fn test_path_round_trip_is_stable_across_encodings() {
        // Same document, different key order and whitespace.
        let a: Value = serde_json::from_str(r#"{"x": {"y": 5}, "z": 1}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "z" : 1 , "x":{"y":5} }"#).unwrap();
        assert_eq!(lookup(&a, None, "x.y"), lookup(&b, None, "x.y"));
    }
}

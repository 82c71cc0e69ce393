//! Emission model and sink abstraction.
//!
//! The mapper produces [`Emission`]s; a sink forwards them to OTLP, to
//! stderr in dry-run mode, or into a buffer for tests. `scope` carries the
//! resource identity (`service.name`): the source name for mapped telemetry,
//! the scraper service name for self-telemetry.

use crate::fingerprint::canonical_json;
use serde_json::Value;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttrValue {
    /// Attribute rendering of a JSON value. A present `null` becomes the
    /// string `"null"`; composite values are rendered canonically.
    pub fn from_json(value: &Value) -> AttrValue {
        match value {
            Value::Null => AttrValue::Str("null".to_string()),
            Value::Bool(b) => AttrValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttrValue::Int(i)
                } else {
                    AttrValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => AttrValue::Str(s.clone()),
            composite => AttrValue::Str(canonical_json(composite)),
        }
    }

    pub fn as_display_string(&self) -> String {
        match self {
            AttrValue::Str(s) => s.clone(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Bool(b) => b.to_string(),
        }
    }
}

pub type Attributes = Vec<(String, AttrValue)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Emission {
    Counter {
        scope: String,
        name: String,
        unit: String,
        value: f64,
        attributes: Attributes,
    },
    Gauge {
        scope: String,
        name: String,
        unit: String,
        value: f64,
        attributes: Attributes,
    },
    Histogram {
        scope: String,
        name: String,
        unit: String,
        /// Explicit bucket boundaries; `None` uses the SDK defaults.
        boundaries: Option<Vec<f64>>,
        value: f64,
        attributes: Attributes,
    },
    Log {
        scope: String,
        severity: Severity,
        body: String,
        attributes: Attributes,
    },
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, emission: Emission);

    fn flush(&self) {}

    fn shutdown(&self) {}
}

/// Dry-run sink: structured lines on stderr, no network export.
#[derive(Default)]
pub struct StderrSink;

impl TelemetrySink for StderrSink {
    fn emit(&self, emission: Emission) {
        let line = match &emission {
            Emission::Counter {
                scope,
                name,
                value,
                attributes,
                ..
            } => serde_json::json!({
                "kind": "counter", "scope": scope, "name": name,
                "value": value, "attributes": attrs_json(attributes),
            }),
            Emission::Gauge {
                scope,
                name,
                value,
                attributes,
                ..
            } => serde_json::json!({
                "kind": "gauge", "scope": scope, "name": name,
                "value": value, "attributes": attrs_json(attributes),
            }),
            Emission::Histogram {
                scope,
                name,
                value,
                attributes,
                ..
            } => serde_json::json!({
                "kind": "histogram", "scope": scope, "name": name,
                "value": value, "attributes": attrs_json(attributes),
            }),
            Emission::Log {
                scope,
                severity,
                body,
                attributes,
            } => serde_json::json!({
                "kind": "log", "scope": scope, "severity": severity.as_str(),
                "body": body, "attributes": attrs_json(attributes),
            }),
        };
        eprintln!("{}", line);
    }
}

fn attrs_json(attributes: &Attributes) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in attributes {
        let rendered = match value {
            AttrValue::Str(s) => Value::String(s.clone()),
            AttrValue::Int(i) => Value::from(*i),
            AttrValue::Float(f) => Value::from(*f),
            AttrValue::Bool(b) => Value::from(*b),
        };
        map.insert(key.clone(), rendered);
    }
    Value::Object(map)
}

/// Buffering sink for tests and manual inspection.
#[derive(Default)]
pub struct CaptureSink {
    emissions: Mutex<Vec<Emission>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Emission> {
        std::mem::take(&mut self.emissions.lock().expect("capture sink poisoned"))
    }

    pub fn snapshot(&self) -> Vec<Emission> {
        self.emissions.lock().expect("capture sink poisoned").clone()
    }
}

impl TelemetrySink for CaptureSink {
    fn emit(&self, emission: Emission) {
        self.emissions
            .lock()
            .expect("capture sink poisoned")
            .push(emission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attr_value_from_json_variants() {
        assert_eq!(AttrValue::from_json(&json!(null)), AttrValue::Str("null".into()));
        assert_eq!(AttrValue::from_json(&json!(7)), AttrValue::Int(7));
        assert_eq!(AttrValue::from_json(&json!(1.5)), AttrValue::Float(1.5));
        assert_eq!(AttrValue::from_json(&json!(true)), AttrValue::Bool(true));
        assert_eq!(
            AttrValue::from_json(&json!({"b": 1, "a": 2})),
            AttrValue::Str(r#"{"a":2,"b":1}"#.into())
        );
    }

    #[test]
    fn test_capture_sink_records_in_order() {
        let sink = CaptureSink::new();
        sink.emit(Emission::Counter {
            scope: "s".into(),
            name: "c".into(),
            unit: "1".into(),
            value: 1.0,
            attributes: vec![],
        });
        sink.emit(Emission::Gauge {
            scope: "s".into(),
            name: "g".into(),
            unit: "1".into(),
            value: 2.0,
            attributes: vec![],
        });
        let emissions = sink.take();
        assert_eq!(emissions.len(), 2);
        assert!(matches!(emissions[0], Emission::Counter { .. }));
        assert!(sink.take().is_empty());
    }
}

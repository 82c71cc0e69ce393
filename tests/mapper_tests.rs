//! Telemetry mapper behavior over a capturing sink.

use otelbridge::config::{load_config_str, SourceConfig};
use otelbridge::telemetry::{AttrValue, CaptureSink, Emission, Severity, Telemetry};
use serde_json::{json, Value};
use std::sync::Arc;

fn source(yaml: &str) -> SourceConfig {
    let config = load_config_str(&format!(
        r#"
scraper:
  otelCollectorEndpoint: http://localhost:4317
sources:
{}
"#,
        yaml
    ))
    .unwrap();
    config.sources.into_iter().next().unwrap()
}

fn telemetry() -> (Telemetry, Arc<CaptureSink>) {
    let sink = Arc::new(CaptureSink::new());
    (Telemetry::with_sink(sink.clone(), "scraper-self", true), sink)
}

fn emit(source: &SourceConfig, records: Vec<Value>) -> Vec<Emission> {
    let (telemetry, sink) = telemetry();
    let root = Value::Array(records.clone());
    telemetry.emit_for_records(source, &records, &root);
    sink.take()
}

#[test]
fn test_gauge_extraction_skips_absent_and_non_numeric() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    emitLogs: false
    baseUrl: https://example.com
    endpoint: /metrics
    scrape:
      type: instant
    gaugeReadings:
      - name: temperature
        dataKey: temp
        unit: Cel
"#,
    );
    let emissions = emit(
        &source,
        vec![
            json!({"temp": 21.5}),
            json!({"temp": "22"}),
            json!({"other": 1}),
            json!({"temp": "not-numeric"}),
        ],
    );
    let gauges: Vec<f64> = emissions
        .iter()
        .filter_map(|e| match e {
            Emission::Gauge { name, value, .. } if name == "temperature" => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(gauges, vec![21.5, 22.0]);
}

#[test]
fn test_counter_value_key_extraction_with_default_increment() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    emitLogs: false
    baseUrl: https://example.com
    endpoint: /metrics
    scrape:
      type: instant
    counterReadings:
      - name: bytes_total
        valueKey: size
      - name: requests_total
"#,
    );
    let emissions = emit(&source, vec![json!({"size": 512}), json!({"size": "oops"})]);
    let by_name = |name: &str| -> Vec<f64> {
        emissions
            .iter()
            .filter_map(|e| match e {
                Emission::Counter { name: n, value, .. } if n == name => Some(*value),
                _ => None,
            })
            .collect()
    };
    // Non-numeric extraction falls back to an increment of one.
    assert_eq!(by_name("bytes_total"), vec![512.0, 1.0]);
    assert_eq!(by_name("requests_total"), vec![1.0, 1.0]);
}

#[test]
fn test_histogram_carries_explicit_boundaries() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    emitLogs: false
    baseUrl: https://example.com
    endpoint: /metrics
    scrape:
      type: instant
    histogramReadings:
      - name: latency_seconds
        dataKey: latency
        unit: s
        buckets: [0.1, 0.5, 1.0]
"#,
    );
    let emissions = emit(&source, vec![json!({"latency": 0.3})]);
    let Emission::Histogram {
        boundaries, value, ..
    } = &emissions[0]
    else {
        panic!("expected histogram");
    };
    assert_eq!(boundaries.as_deref(), Some(&[0.1, 0.5, 1.0][..]));
    assert_eq!(*value, 0.3);
}

#[test]
fn test_as_metric_applies_value_mapping_and_skips_unmapped() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    emitLogs: false
    baseUrl: https://example.com
    endpoint: /metrics
    scrape:
      type: instant
    attributes:
      - name: state
        dataKey: state
        asMetric:
          metricName: state_value
          valueMapping:
            up: 1.0
            down: 0.0
"#,
    );
    let emissions = emit(
        &source,
        vec![json!({"state": "up"}), json!({"state": "unknown"})],
    );
    let counters: Vec<(&f64, &Vec<(String, AttrValue)>)> = emissions
        .iter()
        .filter_map(|e| match e {
            Emission::Counter {
                name,
                value,
                attributes,
                ..
            } if name == "state_value" => Some((value, attributes)),
            _ => None,
        })
        .collect();
    assert_eq!(counters.len(), 1);
    assert_eq!(*counters[0].0, 1.0);
    assert_eq!(
        counters[0].1,
        &vec![("state".to_string(), AttrValue::Str("up".to_string()))]
    );
}

#[test]
fn test_logs_use_ordered_severity_rules_and_canonical_body() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /events
    scrape:
      type: instant
    attributes:
      - name: id
        dataKey: id
    logStatusField:
      name: status
      rules:
        - severity: error
          matchType: in
          value: [failed, fatal]
        - severity: warning
          matchType: equals
          value: degraded
"#,
    );
    let emissions = emit(
        &source,
        vec![
            json!({"status": "failed", "id": 1}),
            json!({"status": "degraded", "id": 2}),
            json!({"status": "ok", "id": 3}),
        ],
    );
    let logs: Vec<(Severity, &str)> = emissions
        .iter()
        .filter_map(|e| match e {
            Emission::Log { severity, body, .. } => Some((*severity, body.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].0, Severity::Error);
    assert_eq!(logs[1].0, Severity::Warning);
    assert_eq!(logs[2].0, Severity::Info);
    // Canonical body: keys sorted, no whitespace.
    assert_eq!(logs[0].1, r#"{"id":1,"status":"failed"}"#);
}

#[test]
fn test_emit_logs_false_suppresses_log_records() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    emitLogs: false
    baseUrl: https://example.com
    endpoint: /events
    scrape:
      type: instant
"#,
    );
    let emissions = emit(&source, vec![json!({"id": 1})]);
    assert!(emissions
        .iter()
        .all(|e| !matches!(e, Emission::Log { .. })));
}

#[test]
fn test_null_attribute_value_is_emitted_absent_is_omitted() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    emitLogs: false
    baseUrl: https://example.com
    endpoint: /events
    scrape:
      type: instant
    counterReadings:
      - name: events
    attributes:
      - name: region
        dataKey: region
      - name: zone
        dataKey: zone
"#,
    );
    let emissions = emit(&source, vec![json!({"region": null})]);
    let Emission::Counter { attributes, .. } = &emissions[0] else {
        panic!("expected counter");
    };
    // `region` is present-but-null, `zone` is absent.
    assert_eq!(
        attributes,
        &vec![("region".to_string(), AttrValue::Str("null".to_string()))]
    );
}

#[test]
fn test_root_anchored_attribute_reads_response_root() {
    let source = source(
        r#"
  - name: demo
    frequency: 1h
    emitLogs: false
    baseUrl: https://example.com
    endpoint: /events
    scrape:
      type: instant
    counterReadings:
      - name: events
    attributes:
      - name: page
        dataKey: $root.meta.page
      - name: id
        dataKey: id
"#,
    );
    let (telemetry, sink) = telemetry();
    let root = json!({"meta": {"page": 4}, "items": [{"id": 9}]});
    let records = vec![json!({"id": 9})];
    telemetry.emit_for_records(&source, &records, &root);
    let emissions = sink.take();
    let Emission::Counter { attributes, .. } = &emissions[0] else {
        panic!("expected counter");
    };
    assert_eq!(
        attributes,
        &vec![
            ("page".to_string(), AttrValue::Int(4)),
            ("id".to_string(), AttrValue::Int(9)),
        ]
    );
}

#[test]
fn test_self_telemetry_dedupe_hit_rate_zero_when_empty() {
    let (telemetry, sink) = telemetry();
    telemetry.record_dedupe("demo", "instant", 0, 0, 0);
    let emissions = sink.take();
    let Some(Emission::Gauge { value, .. }) = emissions.iter().find(
        |e| matches!(e, Emission::Gauge { name, .. } if name == "scraper_dedupe_hit_rate"),
    ) else {
        panic!("expected hit-rate gauge");
    };
    assert_eq!(*value, 0.0);
}

#[test]
fn test_self_telemetry_disabled_emits_nothing() {
    let sink = Arc::new(CaptureSink::new());
    let telemetry = Telemetry::with_sink(sink.clone(), "scraper-self", false);
    telemetry.record_scrape("demo", "instant", "success", 0.5, 3);
    telemetry.record_dedupe("demo", "instant", 1, 2, 3);
    telemetry.record_cleanup("fingerprint_cleanup", "sqlite", 0.1, Some(4));
    assert!(sink.take().is_empty());
}

#[test]
fn test_cleanup_metrics_carry_job_and_backend_labels() {
    let (telemetry, sink) = telemetry();
    telemetry.record_cleanup("fingerprint_cleanup", "sqlite", 0.25, Some(12));
    let emissions = sink.take();
    let expected = vec![
        ("job".to_string(), AttrValue::Str("fingerprint_cleanup".to_string())),
        ("backend".to_string(), AttrValue::Str("sqlite".to_string())),
    ];
    let mut saw_duration = false;
    let mut saw_items = false;
    for emission in &emissions {
        match emission {
            Emission::Histogram {
                name, attributes, ..
            } if name == "scraper_cleanup_duration_seconds" => {
                assert_eq!(attributes, &expected);
                saw_duration = true;
            }
            Emission::Counter {
                name,
                value,
                attributes,
                ..
            } if name == "scraper_cleanup_items_total" => {
                assert_eq!(*value, 12.0);
                assert_eq!(attributes, &expected);
                saw_items = true;
            }
            _ => {}
        }
    }
    assert!(saw_duration && saw_items);
}

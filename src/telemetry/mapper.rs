//! Maps surviving records onto metric and log emissions, and emits the
//! scraper's own operational telemetry.

use super::sink::{AttrValue, Attributes, Emission, Severity, TelemetrySink};
use crate::config::{LogSeverityName, LogStatusField, ScraperSettings, SourceConfig};
use crate::extract;
use crate::fingerprint::canonical_json;
use crate::scrape::pipeline::predicate_matches;
use crate::telemetry::otlp::{OtlpSink, TelemetryError};
use crate::telemetry::sink::StderrSink;
use serde_json::Value;
use std::sync::Arc;

pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    service_name: String,
    self_enabled: bool,
}

impl Telemetry {
    /// Build the production telemetry pipeline: OTLP unless dry-run, which
    /// writes structured lines to stderr instead.
    pub fn from_settings(settings: &ScraperSettings) -> Result<Self, TelemetryError> {
        let sink: Arc<dyn TelemetrySink> = if settings.dry_run {
            tracing::info!("dry-run enabled, telemetry goes to stderr");
            Arc::new(StderrSink)
        } else {
            Arc::new(OtlpSink::new(
                &settings.otel_collector_endpoint,
                settings.otel_transport,
            ))
        };
        Ok(Self {
            sink,
            service_name: settings.service_name.clone(),
            self_enabled: settings.enable_self_telemetry,
        })
    }

    /// Test/bench constructor over an arbitrary sink.
    pub fn with_sink(sink: Arc<dyn TelemetrySink>, service_name: &str, self_enabled: bool) -> Self {
        Self {
            sink,
            service_name: service_name.to_string(),
            self_enabled,
        }
    }

    pub fn flush(&self) {
        self.sink.flush();
    }

    pub fn shutdown(&self) {
        self.sink.shutdown();
    }

    /// Emit all configured metrics and logs for the surviving records of one
    /// unit. `root` is the raw response payload, for `$root.`-anchored paths.
    pub fn emit_for_records(&self, source: &SourceConfig, records: &[Value], root: &Value) {
        for record in records {
            let attributes = self.record_attributes(source, record, root);
            self.emit_gauges(source, record, root, &attributes);
            self.emit_counters(source, record, root, &attributes);
            self.emit_histograms(source, record, root, &attributes);
            self.emit_attribute_metrics(source, record, root);
            if source.emit_logs {
                self.emit_log(source, record, root, &attributes);
            }
        }
    }

    /// The resolved attribute set is the label set for every metric emitted
    /// for this record; absent attributes are omitted.
    fn record_attributes(&self, source: &SourceConfig, record: &Value, root: &Value) -> Attributes {
        let mut attributes = Vec::new();
        for spec in &source.attributes {
            if let Some(value) = extract::lookup(record, Some(root), &spec.data_key) {
                attributes.push((spec.name.clone(), AttrValue::from_json(value)));
            }
        }
        attributes
    }

    fn emit_gauges(
        &self,
        source: &SourceConfig,
        record: &Value,
        root: &Value,
        attributes: &Attributes,
    ) {
        for gauge in &source.gauge_readings {
            let value = match gauge.fixed_value {
                Some(fixed) => Some(fixed),
                None => gauge
                    .data_key
                    .as_deref()
                    .and_then(|key| extract::lookup(record, Some(root), key))
                    .and_then(numeric),
            };
            let Some(value) = value else { continue };
            self.sink.emit(Emission::Gauge {
                scope: source.name.clone(),
                name: gauge.name.clone(),
                unit: gauge.unit.clone(),
                value,
                attributes: attributes.clone(),
            });
        }
    }

    fn emit_counters(
        &self,
        source: &SourceConfig,
        record: &Value,
        root: &Value,
        attributes: &Attributes,
    ) {
        for counter in &source.counter_readings {
            let extracted = counter
                .value_key
                .as_deref()
                .or(counter.data_key.as_deref())
                .and_then(|key| extract::lookup(record, Some(root), key))
                .and_then(numeric);
            let value = counter.fixed_value.or(extracted).unwrap_or(1.0);
            self.sink.emit(Emission::Counter {
                scope: source.name.clone(),
                name: counter.name.clone(),
                unit: counter.unit.clone(),
                value,
                attributes: attributes.clone(),
            });
        }
    }

    fn emit_histograms(
        &self,
        source: &SourceConfig,
        record: &Value,
        root: &Value,
        attributes: &Attributes,
    ) {
        for histogram in &source.histogram_readings {
            let value = match histogram.fixed_value {
                Some(fixed) => Some(fixed),
                None => histogram
                    .data_key
                    .as_deref()
                    .and_then(|key| extract::lookup(record, Some(root), key))
                    .and_then(numeric),
            };
            let Some(value) = value else { continue };
            self.sink.emit(Emission::Histogram {
                scope: source.name.clone(),
                name: histogram.name.clone(),
                unit: histogram.unit.clone(),
                boundaries: Some(histogram.buckets.clone()),
                value,
                attributes: attributes.clone(),
            });
        }
    }

    /// Attributes flagged `asMetric` emit a per-value counter, converting
    /// values through `valueMapping`; unmapped values are skipped.
    fn emit_attribute_metrics(&self, source: &SourceConfig, record: &Value, root: &Value) {
        for spec in &source.attributes {
            let Some(as_metric) = &spec.as_metric else {
                continue;
            };
            let Some(value) = extract::lookup(record, Some(root), &spec.data_key) else {
                continue;
            };
            let attr_value = AttrValue::from_json(value);
            let Some(mapped) = as_metric
                .value_mapping
                .get(&attr_value.as_display_string())
            else {
                continue;
            };
            let metric_name = as_metric
                .metric_name
                .clone()
                .unwrap_or_else(|| spec.name.clone());
            self.sink.emit(Emission::Counter {
                scope: source.name.clone(),
                name: metric_name,
                unit: as_metric.unit.clone(),
                value: *mapped,
                attributes: vec![(spec.name.clone(), attr_value)],
            });
        }
    }

    fn emit_log(
        &self,
        source: &SourceConfig,
        record: &Value,
        root: &Value,
        attributes: &Attributes,
    ) {
        let severity = resolve_severity(record, root, source.log_status_field.as_ref());
        self.sink.emit(Emission::Log {
            scope: source.name.clone(),
            severity,
            body: canonical_json(record),
            attributes: attributes.clone(),
        });
    }

    /// One scrape finished (or was skipped); record outcome metrics.
    pub fn record_scrape(
        &self,
        source: &str,
        api_type: &str,
        status: &str,
        duration_seconds: f64,
        records_emitted: u64,
    ) {
        if !self.self_enabled {
            return;
        }
        let attributes: Attributes = vec![
            ("source".to_string(), AttrValue::Str(source.to_string())),
            ("status".to_string(), AttrValue::Str(status.to_string())),
            ("api_type".to_string(), AttrValue::Str(api_type.to_string())),
        ];
        self.self_counter("scraper_scrape_total", "1", 1.0, attributes.clone());
        self.sink.emit(Emission::Histogram {
            scope: self.service_name.clone(),
            name: "scraper_scrape_duration_seconds".to_string(),
            unit: "s".to_string(),
            boundaries: None,
            value: duration_seconds,
            attributes: attributes.clone(),
        });
        self.self_gauge(
            "scraper_last_scrape_duration_seconds",
            "s",
            duration_seconds,
            attributes.clone(),
        );
        self.self_gauge(
            "scraper_last_records_emitted",
            "1",
            records_emitted as f64,
            attributes,
        );
    }

    /// Dedup counters plus a point-in-time hit-rate gauge (zero when the
    /// scrape processed no records).
    pub fn record_dedupe(&self, source: &str, api_type: &str, hits: u64, misses: u64, total: u64) {
        if !self.self_enabled {
            return;
        }
        let attributes: Attributes = vec![
            ("source".to_string(), AttrValue::Str(source.to_string())),
            ("api_type".to_string(), AttrValue::Str(api_type.to_string())),
        ];
        self.self_counter(
            "scraper_dedupe_hits_total",
            "1",
            hits as f64,
            attributes.clone(),
        );
        self.self_counter(
            "scraper_dedupe_misses_total",
            "1",
            misses as f64,
            attributes.clone(),
        );
        self.self_counter(
            "scraper_dedupe_total",
            "1",
            total as f64,
            attributes.clone(),
        );
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };
        self.self_gauge("scraper_dedupe_hit_rate", "1", hit_rate, attributes);
    }

    /// Surplus records discarded by the per-scrape cap.
    pub fn record_dropped(&self, source: &str, reason: &str, count: u64) {
        if !self.self_enabled || count == 0 {
            return;
        }
        let attributes: Attributes = vec![
            ("source".to_string(), AttrValue::Str(source.to_string())),
            ("reason".to_string(), AttrValue::Str(reason.to_string())),
        ];
        self.self_counter(
            "scraper_records_dropped_total",
            "1",
            count as f64,
            attributes,
        );
    }

    /// Background maintenance job finished.
    pub fn record_cleanup(
        &self,
        job: &str,
        backend: &str,
        duration_seconds: f64,
        items: Option<u64>,
    ) {
        if !self.self_enabled {
            return;
        }
        let attributes: Attributes = vec![
            ("job".to_string(), AttrValue::Str(job.to_string())),
            ("backend".to_string(), AttrValue::Str(backend.to_string())),
        ];
        self.sink.emit(Emission::Histogram {
            scope: self.service_name.clone(),
            name: "scraper_cleanup_duration_seconds".to_string(),
            unit: "s".to_string(),
            boundaries: None,
            value: duration_seconds,
            attributes: attributes.clone(),
        });
        self.self_gauge(
            "scraper_cleanup_last_duration_seconds",
            "s",
            duration_seconds,
            attributes.clone(),
        );
        if let Some(items) = items {
            self.self_counter(
                "scraper_cleanup_items_total",
                "1",
                items as f64,
                attributes.clone(),
            );
            self.self_gauge("scraper_cleanup_last_items", "1", items as f64, attributes);
        }
    }

    fn self_counter(&self, name: &str, unit: &str, value: f64, attributes: Attributes) {
        self.sink.emit(Emission::Counter {
            scope: self.service_name.clone(),
            name: name.to_string(),
            unit: unit.to_string(),
            value,
            attributes,
        });
    }

    fn self_gauge(&self, name: &str, unit: &str, value: f64, attributes: Attributes) {
        self.sink.emit(Emission::Gauge {
            scope: self.service_name.clone(),
            name: name.to_string(),
            unit: unit.to_string(),
            value,
            attributes,
        });
    }
}

/// Numeric extraction: numbers pass through, numeric strings parse, anything
/// else is absent.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First matching severity rule wins, in config order; `INFO` otherwise.
fn resolve_severity(record: &Value, root: &Value, field: Option<&LogStatusField>) -> Severity {
    let Some(field) = field else {
        return Severity::Info;
    };
    let candidate = extract::lookup(record, Some(root), &field.name);
    for rule in &field.rules {
        if predicate_matches(rule.match_type, candidate, &rule.value) {
            return match rule.severity {
                LogSeverityName::Info => Severity::Info,
                LogSeverityName::Warning => Severity::Warning,
                LogSeverityName::Error => Severity::Error,
            };
        }
    }
    Severity::Info
}

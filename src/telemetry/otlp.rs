//! OTLP sink: exports emissions over gRPC or HTTP/protobuf.
//!
//! Each scope gets its own meter/logger provider so the OTLP resource
//! carries `service.name = scope`. Providers and instruments are created
//! lazily on first use and cached for the life of the process.

use super::sink::{AttrValue, Emission, Severity, TelemetrySink};
use crate::config::OtelTransport;
use opentelemetry::logs::{AnyValue, LogRecord, Logger, LoggerProvider};
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, MeterProvider};
use opentelemetry::KeyValue;
use opentelemetry_otlp::{LogExporter, MetricExporter, WithExportConfig};
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),
}

struct ScopeHandle {
    meter_provider: SdkMeterProvider,
    logger_provider: SdkLoggerProvider,
    meter: Meter,
    logger: opentelemetry_sdk::logs::SdkLogger,
    counters: Mutex<HashMap<String, Counter<f64>>>,
    gauges: Mutex<HashMap<String, Gauge<f64>>>,
    histograms: Mutex<HashMap<String, Histogram<f64>>>,
}

pub struct OtlpSink {
    endpoint: String,
    transport: OtelTransport,
    scopes: RwLock<HashMap<String, Arc<ScopeHandle>>>,
}

impl OtlpSink {
    pub fn new(endpoint: &str, transport: OtelTransport) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            transport,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    fn scope(&self, name: &str) -> Result<Arc<ScopeHandle>, TelemetryError> {
        if let Some(handle) = self.scopes.read().expect("scope map poisoned").get(name) {
            return Ok(handle.clone());
        }
        let mut scopes = self.scopes.write().expect("scope map poisoned");
        if let Some(handle) = scopes.get(name) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(self.build_scope(name)?);
        scopes.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    fn build_scope(&self, name: &str) -> Result<ScopeHandle, TelemetryError> {
        let resource = Resource::builder().with_service_name(name.to_string()).build();

        let metric_exporter = match self.transport {
            OtelTransport::Grpc => MetricExporter::builder()
                .with_tonic()
                .with_endpoint(&self.endpoint)
                .build(),
            OtelTransport::Http => MetricExporter::builder()
                .with_http()
                .with_endpoint(format!("{}/v1/metrics", self.endpoint))
                .build(),
        }
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
        let meter_provider = SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_periodic_exporter(metric_exporter)
            .build();

        let log_exporter = match self.transport {
            OtelTransport::Grpc => LogExporter::builder()
                .with_tonic()
                .with_endpoint(&self.endpoint)
                .build(),
            OtelTransport::Http => LogExporter::builder()
                .with_http()
                .with_endpoint(format!("{}/v1/logs", self.endpoint))
                .build(),
        }
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
        let logger_provider = SdkLoggerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(log_exporter)
            .build();

        let meter = meter_provider.meter("otelbridge");
        let logger = logger_provider.logger("otelbridge");
        Ok(ScopeHandle {
            meter_provider,
            logger_provider,
            meter,
            logger,
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        })
    }
}

fn key_values(attributes: &[(String, AttrValue)]) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| match value {
            AttrValue::Str(s) => KeyValue::new(key.clone(), s.clone()),
            AttrValue::Int(i) => KeyValue::new(key.clone(), *i),
            AttrValue::Float(f) => KeyValue::new(key.clone(), *f),
            AttrValue::Bool(b) => KeyValue::new(key.clone(), *b),
        })
        .collect()
}

fn severity_number(severity: Severity) -> opentelemetry::logs::Severity {
    match severity {
        Severity::Info => opentelemetry::logs::Severity::Info,
        Severity::Warning => opentelemetry::logs::Severity::Warn,
        Severity::Error => opentelemetry::logs::Severity::Error,
    }
}

impl TelemetrySink for OtlpSink {
    fn emit(&self, emission: Emission) {
        let scope_name = match &emission {
            Emission::Counter { scope, .. }
            | Emission::Gauge { scope, .. }
            | Emission::Histogram { scope, .. }
            | Emission::Log { scope, .. } => scope.clone(),
        };
        let handle = match self.scope(&scope_name) {
            Ok(handle) => handle,
            Err(e) => {
                // Exporter rejection is logged; the record still counts as
                // emitted (the exporter owns its buffer semantics).
                tracing::warn!(scope = %scope_name, error = %e, "dropping emission");
                return;
            }
        };
        match emission {
            Emission::Counter {
                name,
                unit,
                value,
                attributes,
                ..
            } => {
                let mut counters = handle.counters.lock().expect("counter map poisoned");
                let counter = counters.entry(name.clone()).or_insert_with(|| {
                    handle.meter.f64_counter(name).with_unit(unit).build()
                });
                counter.add(value, &key_values(&attributes));
            }
            Emission::Gauge {
                name,
                unit,
                value,
                attributes,
                ..
            } => {
                let mut gauges = handle.gauges.lock().expect("gauge map poisoned");
                let gauge = gauges.entry(name.clone()).or_insert_with(|| {
                    handle.meter.f64_gauge(name).with_unit(unit).build()
                });
                gauge.record(value, &key_values(&attributes));
            }
            Emission::Histogram {
                name,
                unit,
                boundaries,
                value,
                attributes,
                ..
            } => {
                let mut histograms = handle.histograms.lock().expect("histogram map poisoned");
                let histogram = histograms.entry(name.clone()).or_insert_with(|| {
                    let builder = handle.meter.f64_histogram(name).with_unit(unit);
                    match boundaries {
                        Some(bounds) => builder.with_boundaries(bounds).build(),
                        None => builder.build(),
                    }
                });
                histogram.record(value, &key_values(&attributes));
            }
            Emission::Log {
                severity,
                body,
                attributes,
                ..
            } => {
                let mut record = handle.logger.create_log_record();
                let now = SystemTime::now();
                record.set_timestamp(now);
                record.set_observed_timestamp(now);
                record.set_severity_number(severity_number(severity));
                record.set_severity_text(severity.as_str());
                record.set_body(AnyValue::from(body));
                for (key, value) in attributes {
                    let any = match value {
                        AttrValue::Str(s) => AnyValue::from(s),
                        AttrValue::Int(i) => AnyValue::from(i),
                        AttrValue::Float(f) => AnyValue::from(f),
                        AttrValue::Bool(b) => AnyValue::from(b),
                    };
                    record.add_attribute(key, any);
                }
                handle.logger.emit(record);
            }
        }
    }

    fn flush(&self) {
        let scopes = self.scopes.read().expect("scope map poisoned");
        for (name, handle) in scopes.iter() {
            if let Err(e) = handle.meter_provider.force_flush() {
                tracing::warn!(scope = %name, error = %e, "failed to flush meter provider");
            }
            if let Err(e) = handle.logger_provider.force_flush() {
                tracing::warn!(scope = %name, error = %e, "failed to flush logger provider");
            }
        }
    }

    fn shutdown(&self) {
        self.flush();
        let scopes = self.scopes.read().expect("scope map poisoned");
        for (name, handle) in scopes.iter() {
            if let Err(e) = handle.logger_provider.shutdown() {
                tracing::warn!(scope = %name, error = %e, "failed to shutdown logger provider");
            }
            if let Err(e) = handle.meter_provider.shutdown() {
                tracing::warn!(scope = %name, error = %e, "failed to shutdown meter provider");
            }
        }
    }
}

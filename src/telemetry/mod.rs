pub mod mapper;
pub mod otlp;
pub mod sink;

pub use mapper::Telemetry;
pub use otlp::{OtlpSink, TelemetryError};
pub use sink::{AttrValue, Attributes, CaptureSink, Emission, Severity, StderrSink, TelemetrySink};

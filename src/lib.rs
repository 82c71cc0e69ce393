//! Configuration-driven bridge from HTTP/JSON APIs to OpenTelemetry.
//!
//! Operators declare, per source, how to authenticate, when to poll, how to
//! slice time windows, how to extract records from the response, how to
//! deduplicate across polls, and how to map record fields onto metrics and
//! logs. Output streams to an OTLP collector over gRPC or HTTP.

pub mod cli;
pub mod config;
pub mod extract;
pub mod fingerprint;
pub mod http;
pub mod scheduler;
pub mod scrape;
pub mod store;
pub mod telemetry;
pub mod timeutil;
pub mod web;

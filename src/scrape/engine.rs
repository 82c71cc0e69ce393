//! Scraper engine: executes one tick per source.
//!
//! Admission (overlap policy), planning, per-unit fan-out under the global
//! and per-source semaphores, aggregation, and last-success advancement.
//! One failing sub-window never aborts its siblings; the tick reports
//! partial success but refuses to advance last-success.

use crate::config::{AppConfig, BodyType, HttpMethod, SourceConfig};
use crate::extract;
use crate::http::{AuthError, AuthStrategy, HttpClient, HttpError, RequestBody, RequestSpec};
use crate::scrape::pipeline::{PipelineStats, RecordPipeline};
use crate::scrape::planner::{self, PlanError, WorkUnit};
use crate::store::{ScrapeStore, StoreError};
use crate::telemetry::Telemetry;
use crate::timeutil;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("network error: {0}")]
    Network(#[from] HttpError),

    #[error("authentication rejected with status {0}")]
    Unauthorized(u16),

    #[error("response error: {0}")]
    Response(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("scrape cancelled by shutdown")]
    Cancelled,
}

impl ScrapeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::Auth(_) | ScrapeError::Unauthorized(_) => "auth",
            ScrapeError::Network(_) => "network",
            ScrapeError::Response(_) => "response",
            ScrapeError::Store(_) => "store",
            ScrapeError::Plan(_) => "config",
            ScrapeError::Cancelled => "cancelled",
        }
    }

    fn phase(&self) -> &'static str {
        match self {
            ScrapeError::Auth(_) => "auth",
            ScrapeError::Network(_) | ScrapeError::Unauthorized(_) => "request",
            ScrapeError::Response(_) => "parse",
            ScrapeError::Store(_) => "pipeline",
            ScrapeError::Plan(_) => "plan",
            ScrapeError::Cancelled => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeStatus {
    Success,
    Error,
    Skipped,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Success => "success",
            ScrapeStatus::Error => "error",
            ScrapeStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeOutcome {
    pub status: ScrapeStatus,
    pub records_emitted: u64,
}

struct UnitSuccess {
    records: Vec<Value>,
    payload: Value,
    stats: PipelineStats,
}

pub struct ScraperEngine {
    config: Arc<AppConfig>,
    http: Arc<HttpClient>,
    store: Arc<dyn ScrapeStore>,
    pipeline: RecordPipeline,
    telemetry: Arc<Telemetry>,
    auth: HashMap<String, Arc<AuthStrategy>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    running: StdMutex<HashSet<String>>,
    /// Last-success values retained in memory when the store write failed,
    /// so the next tick still plans from the right start.
    last_success_cache: Mutex<HashMap<String, DateTime<Utc>>>,
    shutdown: watch::Receiver<bool>,
}

impl ScraperEngine {
    pub fn new(
        config: Arc<AppConfig>,
        http: Arc<HttpClient>,
        store: Arc<dyn ScrapeStore>,
        telemetry: Arc<Telemetry>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, AuthError> {
        let mut auth = HashMap::new();
        let mut semaphores = HashMap::new();
        for source in &config.sources {
            // Strategies live for the process so token caches survive ticks.
            auth.insert(
                source.name.clone(),
                Arc::new(AuthStrategy::build(source.auth.as_ref())?),
            );
            let limit = source
                .scrape
                .max_concurrency
                .unwrap_or(config.scraper.default_source_concurrency)
                .max(1);
            semaphores.insert(source.name.clone(), Arc::new(Semaphore::new(limit)));
        }
        let pipeline = RecordPipeline::new(store.clone(), config.scraper.fingerprint_store.clone());
        Ok(Self {
            config,
            http,
            store,
            pipeline,
            telemetry,
            auth,
            semaphores,
            running: StdMutex::new(HashSet::new()),
            last_success_cache: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.config.sources
    }

    /// Manual trigger used by the admin API.
    pub async fn scrape_by_name(&self, name: &str) -> Option<ScrapeOutcome> {
        let source = self.config.sources.iter().find(|s| s.name == name)?;
        Some(self.scrape_source(source).await)
    }

    /// Execute one tick for a source.
    pub async fn scrape_source(&self, source: &SourceConfig) -> ScrapeOutcome {
        let api_type = source.scrape.mode.as_str();
        let allow_overlap = source
            .allow_overlap_scans
            .unwrap_or(self.config.scraper.allow_overlap_scans);
        if !allow_overlap {
            let mut running = self.running.lock().expect("running set poisoned");
            if !running.insert(source.name.clone()) {
                tracing::info!(source = %source.name, "previous scrape still running, skipping tick");
                self.telemetry
                    .record_scrape(&source.name, api_type, "skipped", 0.0, 0);
                return ScrapeOutcome {
                    status: ScrapeStatus::Skipped,
                    records_emitted: 0,
                };
            }
        }

        let started = std::time::Instant::now();
        let (status, records_emitted, stats) = self.run_tick(source).await;
        if !allow_overlap {
            self.running
                .lock()
                .expect("running set poisoned")
                .remove(&source.name);
        }

        let duration = started.elapsed().as_secs_f64();
        self.telemetry.record_scrape(
            &source.name,
            api_type,
            status.as_str(),
            duration,
            records_emitted,
        );
        if status != ScrapeStatus::Skipped {
            self.telemetry
                .record_dedupe(&source.name, api_type, stats.hits, stats.misses, stats.total);
            self.telemetry
                .record_dropped(&source.name, "record_cap", stats.dropped_by_cap);
        }
        tracing::info!(
            source = %source.name,
            status = status.as_str(),
            records = records_emitted,
            duration_seconds = duration,
            "scrape complete"
        );
        ScrapeOutcome {
            status,
            records_emitted,
        }
    }

    async fn run_tick(&self, source: &SourceConfig) -> (ScrapeStatus, u64, PipelineStats) {
        let now = Utc::now();
        let empty = PipelineStats::default();

        let cached = self
            .last_success_cache
            .lock()
            .await
            .get(&source.name)
            .copied();
        let stored = match self.store.load_last_success(&source.name).await {
            Ok(value) => value,
            Err(e) if cached.is_some() => {
                tracing::warn!(
                    source = %source.name,
                    error = %e,
                    "state load failed, planning from in-memory last-success"
                );
                None
            }
            Err(e) => {
                tracing::error!(
                    source = %source.name,
                    phase = "state",
                    error_kind = "store",
                    message = %e,
                    "cannot load last-success"
                );
                return (ScrapeStatus::Error, 0, empty);
            }
        };
        let last_success = match (stored, cached) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        if last_success.is_none() && !source.run_first_scrape {
            tracing::info!(
                source = %source.name,
                "first scrape disabled, recording now as last-success"
            );
            self.advance_last_success(source, now).await;
            return (ScrapeStatus::Skipped, 0, empty);
        }

        let plan = match planner::plan_scrape(source, &self.config.scraper, now, last_success) {
            Ok(plan) => plan,
            Err(e) => {
                let e = ScrapeError::from(e);
                tracing::error!(
                    source = %source.name,
                    phase = e.phase(),
                    error_kind = e.kind(),
                    message = %e,
                    "planning failed"
                );
                return (ScrapeStatus::Error, 0, empty);
            }
        };
        tracing::debug!(source = %source.name, units = plan.units.len(), "tick planned");

        let auth = self.auth.get(&source.name).cloned();
        let semaphore = self.semaphores.get(&source.name).cloned();
        let (Some(auth), Some(semaphore)) = (auth, semaphore) else {
            tracing::error!(
                source = %source.name,
                phase = "plan",
                error_kind = "config",
                message = "source not registered with engine",
                "planning failed"
            );
            return (ScrapeStatus::Error, 0, empty);
        };

        let unit_futures = plan
            .units
            .iter()
            .map(|unit| self.run_unit(source, unit, &auth, &semaphore));
        let results = futures::future::join_all(unit_futures).await;

        let mut had_errors = false;
        let mut records_emitted = 0u64;
        let mut stats = PipelineStats::default();
        for result in results {
            match result {
                Ok(unit) => {
                    stats.merge(&unit.stats);
                    records_emitted += unit.records.len() as u64;
                    if !unit.records.is_empty() {
                        self.telemetry
                            .emit_for_records(source, &unit.records, &unit.payload);
                    }
                }
                Err(e) => {
                    had_errors = true;
                    tracing::error!(
                        source = %source.name,
                        phase = e.phase(),
                        error_kind = e.kind(),
                        message = %e,
                        "unit failed"
                    );
                }
            }
        }

        if had_errors {
            // The next tick retries the full range.
            (ScrapeStatus::Error, records_emitted, stats)
        } else {
            self.advance_last_success(source, plan.end).await;
            (ScrapeStatus::Success, records_emitted, stats)
        }
    }

    /// Persist the new last-success; a store failure is logged and the value
    /// is retained in memory for the next tick.
    async fn advance_last_success(&self, source: &SourceConfig, end: DateTime<Utc>) {
        self.last_success_cache
            .lock()
            .await
            .insert(source.name.clone(), end);
        if let Err(e) = self.store.save_last_success(&source.name, end).await {
            tracing::warn!(
                source = %source.name,
                error = %e,
                "failed to persist last-success, keeping it in memory"
            );
        }
    }

    async fn run_unit(
        &self,
        source: &SourceConfig,
        unit: &WorkUnit,
        auth: &AuthStrategy,
        semaphore: &Semaphore,
    ) -> Result<UnitSuccess, ScrapeError> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| ScrapeError::Cancelled)?;
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = async {
                // A dropped sender means no shutdown signal will ever come.
                if shutdown.wait_for(|stop| *stop).await.is_err() {
                    std::future::pending::<()>().await;
                }
            } => Err(ScrapeError::Cancelled),
            result = self.execute_unit(source, unit, auth) => result,
        }
    }

    async fn execute_unit(
        &self,
        source: &SourceConfig,
        unit: &WorkUnit,
        auth: &AuthStrategy,
    ) -> Result<UnitSuccess, ScrapeError> {
        let scrape = &source.scrape;
        let mut headers: Vec<(String, String)> = scrape
            .extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.extend(auth.headers(&self.http).await?);

        let mut query: Vec<(String, String)> = Vec::new();
        let mut raw_query: Vec<(String, String)> = Vec::new();

        match unit {
            WorkUnit::Instant => {}
            WorkUnit::Window { start, end } => {
                let range_keys = scrape
                    .range_keys
                    .as_ref()
                    .ok_or(ScrapeError::Plan(PlanError::MissingRangeKeys))?;
                let format = planner::time_format(source, &self.config.scraper);
                let start_key = range_keys.start_key.clone().unwrap_or_default();
                let end_key = range_keys.end_key.clone().unwrap_or_default();
                let start_value = timeutil::format_datetime(*start, Some(format));
                let end_value = timeutil::format_datetime(*end, Some(format));
                if scrape.url_encode_time_keys {
                    query.push((start_key, start_value));
                    query.push((end_key, end_value));
                } else {
                    raw_query.push((start_key, start_value));
                    raw_query.push((end_key, end_value));
                }
            }
            WorkUnit::Relative { unit, value } => {
                query.push((unit.as_str().to_string(), value.to_string()));
            }
        }

        for (key, value) in &scrape.extra_args {
            match value.get("noEncodeValue").and_then(Value::as_str) {
                Some(raw) => raw_query.push((key.clone(), raw.to_string())),
                None => query.push((key.clone(), render_arg(value))),
            }
        }

        let url = HttpClient::build_url(&source.base_url, &source.endpoint);
        let spec = match scrape.http_method {
            HttpMethod::Get => RequestSpec {
                method: HttpMethod::Get,
                url,
                headers,
                query,
                raw_query,
                body: None,
            },
            HttpMethod::Post => {
                // Time keys and extra args travel in the body for POST.
                let pairs: Vec<(String, String)> =
                    query.into_iter().chain(raw_query).collect();
                let body = match scrape.body_type {
                    BodyType::Json => {
                        let mut map = serde_json::Map::new();
                        for (key, value) in &pairs {
                            let original = scrape.extra_args.get(key);
                            match original {
                                Some(v) if v.get("noEncodeValue").is_none() => {
                                    map.insert(key.clone(), v.clone());
                                }
                                _ => {
                                    map.insert(key.clone(), Value::String(value.clone()));
                                }
                            }
                        }
                        RequestBody::Json(Value::Object(map))
                    }
                    BodyType::Raw => RequestBody::Form(pairs),
                };
                RequestSpec {
                    method: HttpMethod::Post,
                    url,
                    headers,
                    query: Vec::new(),
                    raw_query: Vec::new(),
                    body: Some(body),
                }
            }
        };

        let response = self.http.request(spec).await?;
        if response.status == 401 || response.status == 403 {
            return Err(ScrapeError::Unauthorized(response.status));
        }
        if !response.is_success() {
            let snippet: String = String::from_utf8_lossy(&response.body)
                .chars()
                .take(200)
                .collect();
            return Err(ScrapeError::Response(format!(
                "status {}: {}",
                response.status, snippet
            )));
        }

        let payload: Value = serde_json::from_slice(&response.body)
            .map_err(|e| ScrapeError::Response(format!("invalid JSON response: {}", e)))?;
        if uses_root_paths(source) && !payload.is_object() {
            return Err(ScrapeError::Response(
                "root-scoped lookups require an object payload".to_string(),
            ));
        }
        let records = extract::extract_records(&payload, source.data_key.as_deref())
            .map_err(|e| ScrapeError::Response(e.to_string()))?;
        tracing::debug!(
            source = %source.name,
            unit = ?unit_label(unit),
            records = records.len(),
            "unit fetched"
        );

        let (records, stats) = self.pipeline.run(records, source).await?;
        Ok(UnitSuccess {
            records,
            payload,
            stats,
        })
    }
}

fn unit_label(unit: &WorkUnit) -> String {
    match unit {
        WorkUnit::Instant => "instant".to_string(),
        WorkUnit::Window { start, end } => format!("[{}, {})", start, end),
        WorkUnit::Relative { unit, value } => format!("{}={}", unit.as_str(), value),
    }
}

fn render_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// True if any metric, attribute, or severity path is `$root.`-anchored, in
/// which case the payload must be an object.
fn uses_root_paths(source: &SourceConfig) -> bool {
    let root = |path: &str| path.starts_with("$root.");
    source
        .gauge_readings
        .iter()
        .filter_map(|g| g.data_key.as_deref())
        .chain(
            source
                .counter_readings
                .iter()
                .flat_map(|c| [c.data_key.as_deref(), c.value_key.as_deref()])
                .flatten(),
        )
        .chain(
            source
                .histogram_readings
                .iter()
                .filter_map(|h| h.data_key.as_deref()),
        )
        .chain(source.attributes.iter().map(|a| a.data_key.as_str()))
        .chain(source.log_status_field.iter().map(|f| f.name.as_str()))
        .any(root)
}

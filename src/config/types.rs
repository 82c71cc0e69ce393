use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub scraper: ScraperSettings,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScraperSettings {
    #[serde(default)]
    pub enable_self_telemetry: bool,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub allow_overlap_scans: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub otel_collector_endpoint: String,
    #[serde(default = "default_true")]
    pub enforce_tls: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub terminate_gracefully: bool,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default)]
    pub enable_admin_api: bool,
    #[serde(default)]
    pub admin_secret_env: Option<String>,
    #[serde(default = "default_time_format")]
    pub default_time_format: String,
    #[serde(default = "default_global_concurrency")]
    pub max_global_concurrency: usize,
    #[serde(default = "default_source_concurrency")]
    pub default_source_concurrency: usize,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    #[serde(default)]
    pub fingerprint_store: FingerprintStoreConfig,
    #[serde(default)]
    pub otel_transport: OtelTransport,
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "otelbridge".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_port() -> u16 {
    8080
}

fn default_time_format() -> String {
    "%Y-%m-%dT%H:%M:%S%z".to_string()
}

fn default_global_concurrency() -> usize {
    10
}

fn default_source_concurrency() -> usize {
    4
}

fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtelTransport {
    #[default]
    Grpc,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FingerprintStoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_max_entries")]
    pub max_entries_per_source: u64,
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_backoff")]
    pub lock_backoff_seconds: f64,
    #[serde(default)]
    pub sqlite: SqliteStoreConfig,
    #[serde(default)]
    pub valkey: ValkeyStoreConfig,
}

impl Default for FingerprintStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            max_entries_per_source: default_max_entries(),
            default_ttl_seconds: default_ttl_seconds(),
            cleanup_interval_seconds: default_cleanup_interval(),
            lock_retries: default_lock_retries(),
            lock_backoff_seconds: default_lock_backoff(),
            sqlite: SqliteStoreConfig::default(),
            valkey: ValkeyStoreConfig::default(),
        }
    }
}

fn default_max_entries() -> u64 {
    50_000
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_cleanup_interval() -> u64 {
    3_600
}

fn default_lock_retries() -> u32 {
    5
}

fn default_lock_backoff() -> f64 {
    0.1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Valkey,
    /// Deprecated alias for `valkey`.
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite => "sqlite",
            StoreBackend::Valkey | StoreBackend::Redis => "valkey",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteStoreConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./otelbridge_fingerprints.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValkeyStoreConfig {
    #[serde(default = "default_valkey_host")]
    pub host: String,
    #[serde(default = "default_valkey_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    /// Name of the environment variable holding the password, if any.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
}

impl Default for ValkeyStoreConfig {
    fn default() -> Self {
        Self {
            host: default_valkey_host(),
            port: default_valkey_port(),
            db: 0,
            password: None,
            ssl: false,
        }
    }
}

fn default_valkey_host() -> String {
    "localhost".to_string()
}

fn default_valkey_port() -> u16 {
    6379
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub frequency: String,
    /// Overrides `scraper.allowOverlapScans` when set; a source can restrict
    /// a permissive global default as well as relax a strict one.
    #[serde(default)]
    pub allow_overlap_scans: Option<bool>,
    #[serde(default = "default_true")]
    pub emit_logs: bool,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    pub scrape: ScrapeConfig,
    pub base_url: String,
    pub endpoint: String,
    #[serde(default)]
    pub data_key: Option<String>,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub delta_detection: DeltaDetectionConfig,
    #[serde(default)]
    pub gauge_readings: Vec<GaugeReading>,
    #[serde(default)]
    pub counter_readings: Vec<CounterReading>,
    #[serde(default)]
    pub histogram_readings: Vec<HistogramReading>,
    #[serde(default)]
    pub attributes: Vec<AttributeSpec>,
    #[serde(default)]
    pub log_status_field: Option<LogStatusField>,
    #[serde(default)]
    pub run_first_scrape: bool,
}

/// Auth strategy selection. Secrets are always referenced by environment
/// variable name, never inlined in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[serde(rename_all = "camelCase")]
    Basic {
        username_env: String,
        password_env: String,
    },
    #[serde(rename_all = "camelCase")]
    Apikey {
        key_name: String,
        key_value_env: String,
    },
    #[serde(rename_all = "camelCase")]
    Oauth {
        #[serde(default)]
        token_env: Option<String>,
        #[serde(default)]
        username_env: Option<String>,
        #[serde(default)]
        password_env: Option<String>,
        #[serde(default)]
        get_token_endpoint: Option<String>,
        #[serde(default)]
        token_key: Option<String>,
        #[serde(default)]
        body_data: Option<OAuthBodyData>,
        #[serde(default)]
        get_token_method: HttpMethod,
        #[serde(default)]
        token_headers: HashMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Azuread {
        client_id_env: String,
        client_secret_env: String,
        token_endpoint: String,
        resource: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthBodyData {
    #[serde(rename = "type")]
    pub body_type: BodyType,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScrapeConfig {
    #[serde(rename = "type")]
    pub mode: ScrapeMode,
    #[serde(default)]
    pub http_method: HttpMethod,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub parallel_window: Option<ParallelWindow>,
    #[serde(default)]
    pub range_keys: Option<RangeKeys>,
    #[serde(default)]
    pub url_encode_time_keys: bool,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub extra_args: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    Range,
    Instant,
}

impl ScrapeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeMode::Range => "range",
            ScrapeMode::Instant => "instant",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Json,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelWindow {
    pub unit: WindowUnit,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowUnit {
    Minutes,
    Hours,
    Days,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RangeKeys {
    #[serde(default)]
    pub start_key: Option<String>,
    #[serde(default)]
    pub end_key: Option<String>,
    #[serde(default)]
    pub first_scrape_start: Option<String>,
    #[serde(default)]
    pub unit: Option<RelativeUnit>,
    #[serde(default = "default_relative_value")]
    pub value: RelativeValue,
    #[serde(default)]
    pub take_negative: bool,
    #[serde(default)]
    pub date_format: Option<String>,
}

impl RangeKeys {
    /// Whether start and end query-parameter names are explicitly provided.
    pub fn has_explicit_bounds(&self) -> bool {
        self.start_key.is_some() && self.end_key.is_some()
    }

    /// Whether this range uses relative-window semantics.
    pub fn is_relative(&self) -> bool {
        self.unit.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelativeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl RelativeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelativeUnit::Minutes => "minutes",
            RelativeUnit::Hours => "hours",
            RelativeUnit::Days => "days",
            RelativeUnit::Weeks => "weeks",
            RelativeUnit::Months => "months",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            RelativeUnit::Minutes => 60,
            RelativeUnit::Hours => 3_600,
            RelativeUnit::Days => 86_400,
            RelativeUnit::Weeks => 604_800,
            RelativeUnit::Months => 2_592_000,
        }
    }
}

/// Either a literal window size or the `from-config` sentinel, which derives
/// the value from the source frequency at scrape time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelativeValue {
    Fixed(i64),
    /// Only `"from-config"` is accepted; checked during validation.
    Keyword(String),
}

impl RelativeValue {
    pub fn is_from_config(&self) -> bool {
        matches!(self, RelativeValue::Keyword(k) if k == "from-config")
    }
}

fn default_relative_value() -> RelativeValue {
    RelativeValue::Keyword("from-config".to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FiltersConfig {
    #[serde(default)]
    pub drop: Vec<DropRule>,
    #[serde(default)]
    pub keep: Vec<KeepRule>,
    #[serde(default)]
    pub limits: FilterLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropRule {
    pub any: Vec<MatchPredicate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepRule {
    pub all: Vec<MatchPredicate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterLimits {
    #[serde(default)]
    pub max_records_per_scrape: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MatchPredicate {
    pub field: String,
    pub match_type: MatchType,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Equals,
    NotEquals,
    In,
    Regex,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeltaDetectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub fingerprint_mode: FingerprintMode,
    #[serde(default)]
    pub fingerprint_keys: Option<Vec<String>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub max_entries: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    #[default]
    FullRecord,
    Keys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GaugeReading {
    pub name: String,
    #[serde(default)]
    pub data_key: Option<String>,
    #[serde(default)]
    pub fixed_value: Option<f64>,
    #[serde(default = "default_unit")]
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CounterReading {
    pub name: String,
    #[serde(default)]
    pub data_key: Option<String>,
    #[serde(default)]
    pub value_key: Option<String>,
    #[serde(default)]
    pub fixed_value: Option<f64>,
    #[serde(default = "default_unit")]
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HistogramReading {
    pub name: String,
    #[serde(default)]
    pub data_key: Option<String>,
    #[serde(default)]
    pub fixed_value: Option<f64>,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub buckets: Vec<f64>,
}

fn default_unit() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AttributeSpec {
    pub name: String,
    pub data_key: String,
    #[serde(default)]
    pub as_metric: Option<AttributeAsMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AttributeAsMetric {
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub value_mapping: HashMap<String, f64>,
    #[serde(default = "default_unit")]
    pub unit: String,
}

/// Ordered severity mapping; the first matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogStatusField {
    pub name: String,
    pub rules: Vec<LogStatusRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LogStatusRule {
    pub severity: LogSeverityName,
    #[serde(default = "default_match_type")]
    pub match_type: MatchType,
    pub value: serde_json::Value,
}

fn default_match_type() -> MatchType {
    MatchType::Equals
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverityName {
    Info,
    Warning,
    Error,
}

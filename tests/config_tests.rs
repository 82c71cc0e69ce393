//! Config parsing and validation over full documents.

use otelbridge::config::{
    load_config_str, AuthConfig, ConfigError, FingerprintMode, HttpMethod, ScrapeMode,
    StoreBackend,
};

#[test]
fn test_full_source_document_round_trip() {
    std::env::set_var("CFG_TEST_API_KEY", "k");
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
  otelTransport: http
  serviceName: bridge-prod
  enableSelfTelemetry: true
  dryRun: false
  maxGlobalConcurrency: 16
  defaultSourceConcurrency: 2
  fingerprintStore:
    backend: sqlite
    maxEntriesPerSource: 1000
    defaultTtlSeconds: 7200
    sqlite:
      path: /tmp/fp.db
sources:
  - name: orders
    frequency: 5min
    allowOverlapScans: true
    runFirstScrape: true
    baseUrl: https://shop.example.com
    endpoint: /v1/orders
    dataKey: data.orders[]
    auth:
      type: apikey
      keyName: x-api-key
      keyValueEnv: CFG_TEST_API_KEY
    scrape:
      type: range
      httpMethod: GET
      urlEncodeTimeKeys: true
      timeFormat: "%s"
      maxConcurrency: 3
      parallelWindow:
        unit: minutes
        value: 30
      rangeKeys:
        startKey: "created[gte]"
        endKey: "created[lt]"
      extraHeaders:
        accept: application/json
      extraArgs:
        limit: 100
    filters:
      drop:
        - any:
            - field: status
              matchType: equals
              value: test
      limits:
        maxRecordsPerScrape: 500
    deltaDetection:
      enabled: true
      fingerprintMode: keys
      fingerprintKeys: [id]
      ttlSeconds: 3600
      maxEntries: 200
    counterReadings:
      - name: orders_total
    attributes:
      - name: order_id
        dataKey: id
"#;
    let config = load_config_str(yaml).unwrap();
    assert_eq!(config.scraper.service_name, "bridge-prod");
    assert_eq!(config.scraper.fingerprint_store.backend, StoreBackend::Sqlite);
    assert_eq!(config.scraper.fingerprint_store.default_ttl_seconds, 7200);

    let source = &config.sources[0];
    // Tri-state override: explicitly set here, None when omitted.
    assert_eq!(source.allow_overlap_scans, Some(true));
    assert_eq!(source.scrape.mode, ScrapeMode::Range);
    assert_eq!(source.scrape.http_method, HttpMethod::Get);
    assert_eq!(source.scrape.max_concurrency, Some(3));
    assert_eq!(source.data_key.as_deref(), Some("data.orders[]"));
    assert!(matches!(source.auth, Some(AuthConfig::Apikey { .. })));
    assert_eq!(source.delta_detection.fingerprint_mode, FingerprintMode::Keys);
    assert_eq!(source.delta_detection.ttl_seconds, Some(3600));
    let rk = source.scrape.range_keys.as_ref().unwrap();
    assert!(rk.has_explicit_bounds());
    assert!(!rk.is_relative());
}

#[test]
fn test_env_placeholder_interpolation() {
    std::env::set_var("CFG_TEST_ENDPOINT", "http://collector:4317");
    let yaml = r#"
scraper:
  otelCollectorEndpoint: ${CFG_TEST_ENDPOINT}
sources: []
"#;
    let config = load_config_str(yaml).unwrap();
    assert_eq!(config.scraper.otel_collector_endpoint, "http://collector:4317");
}

#[test]
fn test_omitted_source_overlap_flag_stays_unset() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
  allowOverlapScans: true
sources:
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /items
    scrape:
      type: instant
  - name: strict
    frequency: 1h
    allowOverlapScans: false
    baseUrl: https://example.com
    endpoint: /items
    scrape:
      type: instant
"#;
    let config = load_config_str(yaml).unwrap();
    assert_eq!(config.sources[0].allow_overlap_scans, None);
    assert_eq!(config.sources[1].allow_overlap_scans, Some(false));
}

#[test]
fn test_regex_severity_rules_are_accepted_and_validated() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
sources:
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /items
    scrape:
      type: instant
    logStatusField:
      name: status
      rules:
        - severity: error
          matchType: regex
          value: "err.*"
        - severity: warning
          matchType: not_equals
          value: ok
"#;
    load_config_str(yaml).unwrap();

    let broken = yaml.replace("err.*", "([");
    let err = load_config_str(&broken).unwrap_err();
    assert!(err.to_string().contains("invalid regex"));
}

#[test]
fn test_admin_api_requires_secret_env() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
  enableAdminApi: true
sources: []
"#;
    let err = load_config_str(yaml).unwrap_err();
    assert!(err.to_string().contains("adminSecretEnv"));
}

#[test]
fn test_missing_auth_env_is_reported_with_source_context() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
sources:
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /items
    scrape:
      type: instant
    auth:
      type: basic
      usernameEnv: CFG_TEST_NO_SUCH_USER
      passwordEnv: CFG_TEST_NO_SUCH_PASS
"#;
    let err = load_config_str(yaml).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("source 'demo'"));
    assert!(message.contains("CFG_TEST_NO_SUCH_USER"));
    assert!(message.contains("CFG_TEST_NO_SUCH_PASS"));
}

#[test]
fn test_unknown_fields_are_rejected() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
  definitelyNotAKey: true
sources: []
"#;
    assert!(matches!(
        load_config_str(yaml),
        Err(ConfigError::YamlParse(_))
    ));
}

#[test]
fn test_oauth_requires_token_or_runtime_fields() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
sources:
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /items
    scrape:
      type: instant
    auth:
      type: oauth
"#;
    let err = load_config_str(yaml).unwrap_err();
    assert!(err.to_string().contains("tokenEnv or getTokenEndpoint"));
}

#[test]
fn test_invalid_predicate_regex_is_rejected() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
sources:
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /items
    scrape:
      type: instant
    filters:
      drop:
        - any:
            - field: name
              matchType: regex
              value: "(["
"#;
    let err = load_config_str(yaml).unwrap_err();
    assert!(err.to_string().contains("invalid regex"));
}

#[test]
fn test_invalid_frequency_is_rejected() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
sources:
  - name: demo
    frequency: soon
    baseUrl: https://example.com
    endpoint: /items
    scrape:
      type: instant
"#;
    let err = load_config_str(yaml).unwrap_err();
    assert!(err.to_string().contains("frequency"));
}

#[test]
fn test_duplicate_source_names_are_rejected() {
    let yaml = r#"
scraper:
  otelCollectorEndpoint: http://collector:4317
sources:
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /a
    scrape:
      type: instant
  - name: demo
    frequency: 1h
    baseUrl: https://example.com
    endpoint: /b
    scrape:
      type: instant
"#;
    let err = load_config_str(yaml).unwrap_err();
    assert!(err.to_string().contains("duplicate source name"));
}

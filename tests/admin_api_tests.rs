//! Admin API surface: secret gating and manual scrape triggering.

use axum::routing::get;
use axum::{Json, Router};
use otelbridge::config::load_config_str;
use otelbridge::http::HttpClient;
use otelbridge::scrape::ScraperEngine;
use otelbridge::store::MemoryStore;
use otelbridge::telemetry::{CaptureSink, Telemetry};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

async fn spawn_admin() -> (u16, watch::Sender<bool>) {
    // Upstream fixture the engine scrapes on manual trigger.
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = upstream_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let app = Router::new().route("/items", get(|| async { Json(json!([{"id": 1}])) }));
        axum::serve(upstream_listener, app).await.unwrap();
    });

    let config = Arc::new(
        load_config_str(&format!(
            r#"
scraper:
  otelCollectorEndpoint: http://localhost:4317
  enforceTls: false
sources:
  - name: demo
    frequency: 1h
    runFirstScrape: true
    baseUrl: http://{}
    endpoint: /items
    scrape:
      type: instant
"#,
            upstream
        ))
        .unwrap(),
    );
    let sink = Arc::new(CaptureSink::new());
    let telemetry = Arc::new(Telemetry::with_sink(sink, "admin-test", false));
    let http = Arc::new(HttpClient::new(4, false, 1024 * 1024).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Arc::new(
        ScraperEngine::new(
            config,
            http,
            Arc::new(MemoryStore::new()),
            telemetry,
            shutdown_rx.clone(),
        )
        .unwrap(),
    );

    let admin_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = admin_listener.local_addr().unwrap().port();
    drop(admin_listener);
    tokio::spawn(otelbridge::web::run_server(
        engine,
        "sekret".to_string(),
        port,
        shutdown_rx,
    ));
    // Give the server a moment to bind.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    (port, shutdown_tx)
}

#[tokio::test]
async fn test_health_is_open_but_sources_require_secret() {
    let (port, _shutdown) = spawn_admin().await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let unauthorized = client
        .get(format!("http://127.0.0.1:{}/sources", port))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);

    let authorized = client
        .get(format!("http://127.0.0.1:{}/sources", port))
        .header("x-admin-secret", "sekret")
        .send()
        .await
        .unwrap();
    assert_eq!(authorized.status(), 200);
    let sources: serde_json::Value = authorized.json().await.unwrap();
    assert_eq!(sources[0]["name"], "demo");
    assert_eq!(sources[0]["type"], "instant");
}

#[tokio::test]
async fn test_manual_trigger_runs_scrape_and_unknown_source_is_404() {
    let (port, _shutdown) = spawn_admin().await;
    let client = reqwest::Client::new();

    let triggered = client
        .post(format!("http://127.0.0.1:{}/sources/demo/scrape", port))
        .header("x-admin-secret", "sekret")
        .send()
        .await
        .unwrap();
    assert_eq!(triggered.status(), 200);
    let body: serde_json::Value = triggered.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["records_emitted"], 1);

    let missing = client
        .post(format!("http://127.0.0.1:{}/sources/nope/scrape", port))
        .header("x-admin-secret", "sekret")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

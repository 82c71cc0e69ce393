//! Wires config, store, HTTP client, engine, scheduler, and the optional
//! admin API together, then runs until a shutdown signal arrives.

use crate::config::{load_config, AppConfig, ConfigError};
use crate::http::{AuthError, HttpClient, HttpError};
use crate::scheduler::Scheduler;
use crate::scrape::ScraperEngine;
use crate::store::{build_store, StoreError};
use crate::telemetry::{Telemetry, TelemetryError};
use crate::timeutil::TimeError;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("auth setup error: {0}")]
    Auth(#[from] AuthError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("http client error: {0}")]
    Http(#[from] HttpError),

    #[error(transparent)]
    Time(#[from] TimeError),
}

impl RunError {
    /// Whether the failure is a configuration/validation problem (exit 1)
    /// rather than a runtime one (exit 2).
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            RunError::Config(_) | RunError::Auth(_) | RunError::Time(_)
        )
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("otelbridge={}", log_level))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub async fn run(config_path: PathBuf) -> Result<(), RunError> {
    let config: Arc<AppConfig> = Arc::new(load_config(&config_path)?);
    init_tracing(&config.scraper.log_level);
    info!(config_path = %config_path.display(), sources = config.sources.len(), "configuration loaded");

    let telemetry = Arc::new(Telemetry::from_settings(&config.scraper)?);
    let store = build_store(&config.scraper.fingerprint_store).await?;

    // One-time orphan sweep against the live source set.
    let live_sources: HashSet<String> =
        config.sources.iter().map(|s| s.name.clone()).collect();
    let backend = config.scraper.fingerprint_store.backend.as_str();
    let started = Instant::now();
    match store.gc_orphans(&live_sources).await {
        Ok(removed) => {
            telemetry.record_cleanup(
                "orphan_cleanup",
                backend,
                started.elapsed().as_secs_f64(),
                Some(removed),
            );
            info!(removed, "orphan fingerprint cleanup done");
        }
        Err(e) => {
            telemetry.record_cleanup(
                "orphan_cleanup",
                backend,
                started.elapsed().as_secs_f64(),
                None,
            );
            warn!(error = %e, "orphan fingerprint cleanup failed");
        }
    }

    let http = Arc::new(HttpClient::new(
        config.scraper.max_global_concurrency,
        config.scraper.enforce_tls,
        config.scraper.max_response_bytes,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Arc::new(ScraperEngine::new(
        config.clone(),
        http,
        store.clone(),
        telemetry.clone(),
        shutdown_rx.clone(),
    )?);

    let scheduler = Scheduler::new(
        config.clone(),
        engine.clone(),
        store.clone(),
        telemetry.clone(),
    );
    let handles = scheduler.start(shutdown_rx.clone())?;

    let admin_handle = if config.scraper.enable_admin_api {
        // Presence of the env var was validated at config load time.
        let secret_env = config
            .scraper
            .admin_secret_env
            .clone()
            .unwrap_or_default();
        let secret = std::env::var(&secret_env).map_err(|_| {
            RunError::Config(ConfigError::UnresolvedEnv(secret_env.clone()))
        })?;
        let engine = engine.clone();
        let port = config.scraper.service_port;
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = crate::web::run_server(engine, secret, port, rx).await {
                error!(error = %e, "admin API server failed");
            }
        }))
    } else {
        None
    };

    info!("scraper running, press Ctrl+C to shut down");
    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }
    let _ = shutdown_tx.send(true);

    if config.scraper.terminate_gracefully {
        // Outstanding units observe the shutdown watch and cancel; wait for
        // the pipelines to unwind within the grace period.
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                grace_seconds = SHUTDOWN_GRACE.as_secs(),
                "scrape tasks did not stop within the grace period"
            );
        }
    } else {
        for handle in &handles {
            handle.abort();
        }
    }

    if let Some(handle) = admin_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => info!("admin API stopped"),
            Ok(Err(e)) => error!(error = %e, "admin API join error"),
            Err(_) => warn!("admin API shutdown timed out"),
        }
    }

    telemetry.flush();
    telemetry.shutdown();
    if let Err(e) = store.close().await {
        warn!(error = %e, "store close failed");
    }
    info!("shutdown complete");
    Ok(())
}

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;

use super::api::{get_source, health_check, list_sources, trigger_scrape, AppState};
use crate::scrape::ScraperEngine;

/// Start the admin API server. All routes except `/health` require the
/// configured admin secret header.
pub async fn run_server(
    engine: Arc<ScraperEngine>,
    admin_secret: String,
    port: u16,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState {
        engine,
        admin_secret: Arc::new(admin_secret),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sources", get(list_sources))
        .route("/sources/:name", get(get_source))
        .route("/sources/:name/scrape", post(trigger_scrape))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&stop| stop).await;
            tracing::info!("admin API shutting down gracefully");
        })
        .await?;

    Ok(())
}

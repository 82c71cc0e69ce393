use crate::config::SourceConfig;
use crate::scrape::ScraperEngine;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScraperEngine>,
    pub admin_secret: Arc<String>,
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == state.admin_secret.as_str())
}

#[derive(Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub frequency: String,
    #[serde(rename = "type")]
    pub scrape_type: &'static str,
}

impl From<&SourceConfig> for SourceSummary {
    fn from(source: &SourceConfig) -> Self {
        Self {
            name: source.name.clone(),
            frequency: source.frequency.clone(),
            scrape_type: source.scrape.mode.as_str(),
        }
    }
}

#[derive(Serialize)]
pub struct ScrapeResponse {
    pub status: &'static str,
    pub records_emitted: u64,
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn list_sources(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let sources: Vec<SourceSummary> = state.engine.sources().iter().map(Into::into).collect();
    Json(sources).into_response()
}

pub async fn get_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.engine.sources().iter().find(|s| s.name == name) {
        Some(source) => Json(source.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn trigger_scrape(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.engine.scrape_by_name(&name).await {
        Some(outcome) => Json(ScrapeResponse {
            status: outcome.status.as_str(),
            records_emitted: outcome.records_emitted,
        })
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

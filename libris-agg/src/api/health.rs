//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while any enabled provider's circuit is open
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Circuit state per enabled provider
    pub providers: BTreeMap<String, String>,
    pub active_import_jobs: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let enabled = state.orchestrator.provider_ids();

    let providers: BTreeMap<String, String> = state
        .orchestrator
        .breakers()
        .snapshot()
        .into_iter()
        .filter(|(p, _)| enabled.contains(p))
        .map(|(p, circuit)| (p.to_string(), circuit.to_string()))
        .collect();
    let degraded = providers.values().any(|c| c != "closed");

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        module: "libris-agg".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        providers,
        active_import_jobs: state.jobs.active_jobs(),
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

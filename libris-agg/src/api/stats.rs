//! GET /stats/providers

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::db::provider_stats::{summarize, ProviderStats};
use crate::error::ApiResult;
use crate::types::ProviderId;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ProviderStatsEntry {
    #[serde(flatten)]
    pub stats: ProviderStats,
    pub circuit: String,
}

pub async fn provider_stats(State(state): State<AppState>) -> ApiResult<Json<Vec<ProviderStatsEntry>>> {
    let breakers = state.orchestrator.breakers();
    let entries = summarize(&state.db)
        .await?
        .into_iter()
        .map(|stats| {
            let circuit = stats
                .provider
                .parse::<ProviderId>()
                .map(|p| breakers.state(p).to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            ProviderStatsEntry { stats, circuit }
        })
        .collect();
    Ok(Json(entries))
}

pub fn stats_routes() -> Router<AppState> {
    Router::new().route("/stats/providers", get(provider_stats))
}

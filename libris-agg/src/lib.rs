//! libris-agg library interface
//!
//! Book metadata aggregation: provider fanout, merge, two-tier caching and
//! list imports behind a small HTTP API. Exposed as a library so
//! integration tests can drive the orchestrator and the router directly.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod fusion;
pub mod import;
pub mod normalize;
pub mod orchestrator;
pub mod providers;
pub mod types;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use libris_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::import::JobRunner;
use crate::orchestrator::AggregationOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub orchestrator: Arc<AggregationOrchestrator>,
    pub jobs: Arc<JobRunner>,
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        orchestrator: Arc<AggregationOrchestrator>,
        jobs: Arc<JobRunner>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            db,
            orchestrator,
            jobs,
            event_bus,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::lookup_routes())
        .merge(api::list_routes())
        .merge(api::cache_routes())
        .merge(api::stats_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

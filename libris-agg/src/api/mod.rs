//! HTTP API handlers for libris-agg
//!
//! Thin JSON plumbing over the orchestrator and the job runner.

pub mod cache;
pub mod health;
pub mod lists;
pub mod lookup;
pub mod stats;

pub use cache::cache_routes;
pub use health::health_routes;
pub use lists::list_routes;
pub use lookup::lookup_routes;
pub use stats::stats_routes;

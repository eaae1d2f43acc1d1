//! Two-tier cache
//!
//! - **Fast tier:** search results keyed by `QueryFingerprint`, short TTL
//! - **Durable tier:** canonical books keyed by identifier, no TTL
//!
//! Tier failures are reported as `CacheError` and the orchestrator bypasses
//! the failing tier rather than failing the lookup.

pub mod durable;
pub mod fast_tier;

use thiserror::Error;

pub use durable::{DurableTier, SqliteBookStore};
pub use fast_tier::{FastEntrySummary, FastTier, MemoryFastTier};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache tier unavailable: {0}")]
    Unavailable(String),

    #[error("cache payload corrupt: {0}")]
    Corrupt(String),
}

impl From<libris_common::Error> for CacheError {
    fn from(err: libris_common::Error) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Corrupt(err.to_string())
    }
}

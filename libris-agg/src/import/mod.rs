//! List import
//!
//! A job scrapes a list URL page by page and feeds every discovered item
//! through the orchestrator as an ordinary lookup.

pub mod job;
pub mod runner;
pub mod sources;

use thiserror::Error;

pub use job::{ImportJob, ItemFailure, JobStatus};
pub use runner::JobRunner;
pub use sources::{HttpListSources, ListItem, ListPage, ListSource, ListSourceFactory};

#[derive(Debug, Error)]
pub enum JobError {
    /// One item could not be resolved; recorded, never fatal to the job
    #[error("item {index} failed: {reason}")]
    ItemFailed { index: usize, reason: String },

    /// The list itself could not be read
    #[error("list source unreachable: {0}")]
    SourceUnreachable(String),

    /// No list source handles this URL
    #[error("unsupported list url: {0}")]
    UnsupportedSource(String),

    #[error(transparent)]
    Storage(#[from] libris_common::Error),
}

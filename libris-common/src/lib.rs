//! # Libris Common Library
//!
//! Shared code for the Libris services:
//! - Error and result types
//! - Root folder and TOML configuration resolution
//! - Event bus and event types (lookup, provider and import-job events)

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{EventBus, LibrisEvent};

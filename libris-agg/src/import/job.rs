//! Import job model
//!
//! A job moves `queued -> running -> completed | partial | failed` and is
//! mutated only by the runner that owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    /// Finished with at least one failed item, a cancelled run, or a
    /// pagination failure after the first page
    Partial,
    /// Nothing could be imported (first page unreachable)
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// One item that could not be imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// 1-based position in discovery order
    pub item_index: usize,
    /// Identifier or title the list gave for the item
    pub item_ref: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub job_id: Uuid,
    pub source_url: String,
    pub list_title: Option<String>,
    pub status: JobStatus,
    pub discovered: usize,
    pub imported: usize,
    pub failures: Vec<ItemFailure>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(source_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            source_url: source_url.into(),
            list_title: None,
            status: JobStatus::Queued,
            discovered: 0,
            imported: 0,
            failures: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    /// Move to a new status; returns the previous one
    pub fn transition_to(&mut self, status: JobStatus) -> JobStatus {
        let old = self.status;
        self.status = status;
        self.updated_at = Utc::now();
        old
    }

    pub fn record_imported(&mut self) {
        self.imported += 1;
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, item_index: usize, item_ref: impl Into<String>, error: impl Into<String>) {
        let error = error.into();
        self.failures.push(ItemFailure {
            item_index,
            item_ref: item_ref.into(),
            error: error.clone(),
        });
        self.last_error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Terminal status for a run that got past the first page
    pub fn settled_status(&self, interrupted: bool) -> JobStatus {
        if interrupted || !self.failures.is_empty() {
            JobStatus::Partial
        } else {
            JobStatus::Completed
        }
    }
}

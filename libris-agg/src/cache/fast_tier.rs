//! Fast tier: in-process map of fingerprint -> ranked search results

use super::CacheError;
use crate::types::{Book, BookIdentifier, QueryFingerprint};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Inspector view of one live entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FastEntrySummary {
    pub fingerprint: String,
    pub titles: Vec<String>,
    pub expires_in_secs: u64,
}

#[async_trait]
pub trait FastTier: Send + Sync {
    async fn get(&self, fingerprint: &QueryFingerprint) -> Result<Option<Vec<Book>>, CacheError>;

    async fn set(&self, fingerprint: QueryFingerprint, books: Vec<Book>, ttl: Duration) -> Result<(), CacheError>;

    /// Drop every entry containing a book with this identifier
    async fn invalidate_identifier(&self, id: &BookIdentifier) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    /// Live entries, soonest-expiring first
    async fn inspect(&self) -> Result<Vec<FastEntrySummary>, CacheError>;
}

struct FastEntry {
    books: Vec<Book>,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Bounded in-memory fast tier
///
/// Expired entries are dropped lazily on read and on insert; when full, the
/// oldest insertion is evicted.
pub struct MemoryFastTier {
    entries: Mutex<HashMap<QueryFingerprint, FastEntry>>,
    max_entries: usize,
}

impl MemoryFastTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<QueryFingerprint, FastEntry>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("fast tier lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FastTier for MemoryFastTier {
    async fn get(&self, fingerprint: &QueryFingerprint) -> Result<Option<Vec<Book>>, CacheError> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        match entries.get(fingerprint) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.books.clone())),
            Some(_) => {
                entries.remove(fingerprint);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, fingerprint: QueryFingerprint, books: Vec<Book>, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);

        if !entries.contains_key(&fingerprint) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            fingerprint,
            FastEntry {
                books,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate_identifier(&self, id: &BookIdentifier) -> Result<usize, CacheError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, e| !e.books.iter().any(|b| b.has_identifier(id)));
        Ok(before - entries.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }

    async fn inspect(&self) -> Result<Vec<FastEntrySummary>, CacheError> {
        let entries = self.lock()?;
        let now = Instant::now();
        let mut live: Vec<(&QueryFingerprint, &FastEntry)> =
            entries.iter().filter(|(_, e)| e.expires_at > now).collect();
        live.sort_by_key(|(k, e)| (e.expires_at, (*k).clone()));

        Ok(live
            .into_iter()
            .map(|(k, e)| FastEntrySummary {
                fingerprint: k.to_string(),
                titles: e.books.iter().map(|b| b.title.clone()).collect(),
                expires_in_secs: e.expires_at.saturating_duration_since(now).as_secs(),
            })
            .collect())
    }
}

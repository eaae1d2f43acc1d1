//! Shared fixtures for libris-agg integration tests
//!
//! `ScriptedProvider` stands in for a real adapter: it serves a fixed set of
//! partial records, can be switched to answer empty, fail or throttle, and
//! counts calls.

#![allow(dead_code)]

use async_trait::async_trait;
use libris_agg::cache::{MemoryFastTier, SqliteBookStore};
use libris_agg::orchestrator::AggregationOrchestrator;
use libris_agg::providers::BookProvider;
use libris_agg::types::{LookupIntent, PartialBook, ProviderError, ProviderId};
use libris_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    /// Every book for every intent, ignoring the requested identifier
    ServeAny,
    Empty,
    Fail,
    /// Rate limited with an absurd Retry-After
    Throttled,
}

pub struct ScriptedProvider {
    id: ProviderId,
    books: Vec<PartialBook>,
    delay: Duration,
    mode: Mutex<Mode>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(id: ProviderId, books: Vec<PartialBook>) -> Self {
        Self {
            id,
            books,
            delay: Duration::ZERO,
            mode: Mutex::new(Mode::Serve),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BookProvider for ScriptedProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(2)
    }

    async fn fetch(&self, intent: &LookupIntent, _timeout: Duration) -> Result<Vec<PartialBook>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Fail => Err(ProviderError::Unavailable("scripted outage".to_string())),
            Mode::Throttled => Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(u64::MAX)),
            }),
            Mode::Empty => Ok(Vec::new()),
            Mode::ServeAny => Ok(self.books.clone()),
            Mode::Serve => match intent {
                LookupIntent::Search(_) => Ok(self.books.clone()),
                LookupIntent::Identifier { id } => {
                    let hits: Vec<PartialBook> = self
                        .books
                        .iter()
                        .filter(|b| b.identifiers.contains(id))
                        .cloned()
                        .collect();
                    if hits.is_empty() {
                        Err(ProviderError::NotFound)
                    } else {
                        Ok(hits)
                    }
                }
            },
        }
    }
}

pub fn martian_catalog() -> PartialBook {
    let mut p = PartialBook::new(ProviderId::Catalog, "B00B5HZGUG");
    p.title = Some("The Martian".to_string());
    p.authors = vec!["Andy Weir".to_string()];
    p.narrators = vec!["R. C. Bray".to_string()];
    p.runtime_secs = Some(39_060);
    p.language = Some("en".to_string());
    p.chapters = Some(vec![
        libris_agg::types::Chapter {
            title: "Chapter 1".to_string(),
            start_offset_secs: 0,
        },
        libris_agg::types::Chapter {
            title: "Chapter 2".to_string(),
            start_offset_secs: 1_260,
        },
    ]);
    p
}

pub fn martian_ratings() -> PartialBook {
    let mut p = PartialBook::new(ProviderId::Ratings, "18007564");
    p.title = Some("The Martian".to_string());
    p.authors = vec!["Andy Weir".to_string()];
    p.rating = Some(4.41);
    p.rating_count = Some(1_000_000);
    p
}

pub struct Harness {
    pub pool: SqlitePool,
    pub events: EventBus,
    pub fast: Arc<MemoryFastTier>,
    pub orchestrator: Arc<AggregationOrchestrator>,
}

/// Orchestrator over the given providers with in-memory tiers
pub async fn harness(providers: Vec<Arc<dyn BookProvider>>) -> Harness {
    let pool = libris_agg::db::init_memory_pool().await.unwrap();
    let events = EventBus::new(256);
    let fast = Arc::new(MemoryFastTier::new(64));
    let orchestrator = AggregationOrchestrator::new(
        providers,
        fast.clone(),
        Arc::new(SqliteBookStore::new(pool.clone())),
        events.clone(),
    );
    Harness {
        pool,
        events,
        fast,
        orchestrator: Arc::new(orchestrator),
    }
}

//! Aggregation orchestrator
//!
//! The facade every caller goes through. One lookup walks
//! `CacheCheck -> Fanout -> Merge -> Persist -> Done`:
//!
//! 1. **CacheCheck:** fast tier by fingerprint (search), durable tier by
//!    identifier (detail)
//! 2. **Fanout:** every eligible provider with a closed (or probing) circuit,
//!    concurrently, under one aggregate deadline
//! 3. **Merge:** identity grouping plus field-wise resolution
//! 4. **Persist:** durable upsert, then fast-tier set with the TTL
//!
//! Fanout through Persist runs inside a single-flight group keyed by
//! fingerprint or identifier, on its own task.

pub mod circuit_breaker;
pub mod single_flight;

use crate::cache::{DurableTier, FastEntrySummary, FastTier};
use crate::config::{FanoutConfig, ServiceConfig};
use crate::fusion::BookMerger;
use crate::normalize;
use crate::providers::BookProvider;
use crate::types::{
    AggregationError, Book, BookIdentifier, LookupError, LookupFilters, LookupIntent, PartialBook,
    ProviderError, ProviderId, SearchQuery,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use libris_common::{EventBus, LibrisEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState};
pub use single_flight::SingleFlight;

/// Stage of one lookup, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStage {
    CacheCheck,
    Fanout,
    Merge,
    Persist,
    Done,
    Failed,
}

impl LookupStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheCheck => "cache_check",
            Self::Fanout => "fanout",
            Self::Merge => "merge",
            Self::Persist => "persist",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LookupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn log_stage(key: &str, stage: LookupStage) {
    tracing::debug!(key = %key, stage = %stage, "Lookup stage");
}

/// Anything that resolves one intent to one book
///
/// The import runner depends on this rather than on the orchestrator so it
/// can be driven by a scripted lookup in tests.
#[async_trait]
pub trait BookLookup: Send + Sync {
    async fn lookup(&self, intent: LookupIntent) -> Result<Book, LookupError>;
}

type FlightResult = Result<Vec<Book>, LookupError>;

/// Everything a flight needs, cheap to clone into its task
#[derive(Clone)]
struct Core {
    providers: Arc<Vec<Arc<dyn BookProvider>>>,
    fast: Arc<dyn FastTier>,
    durable: Arc<dyn DurableTier>,
    merger: Arc<BookMerger>,
    breakers: Arc<CircuitBreakerRegistry>,
    fanout: FanoutConfig,
    cache_ttl: Duration,
    events: EventBus,
}

/// Outcome of one fanout before merging
#[derive(Debug, Default)]
struct FanoutOutcome {
    partials: Vec<PartialBook>,
    failures: Vec<(ProviderId, ProviderError)>,
    called: usize,
}

pub struct AggregationOrchestrator {
    core: Core,
    flights: SingleFlight<FlightResult>,
}

impl AggregationOrchestrator {
    /// Orchestrator with default merge weights, breaker and fanout settings
    pub fn new(
        providers: Vec<Arc<dyn BookProvider>>,
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
        events: EventBus,
    ) -> Self {
        let defaults = ServiceConfig::default();
        Self {
            core: Core {
                providers: Arc::new(providers),
                fast,
                durable,
                merger: Arc::new(BookMerger::default()),
                breakers: Arc::new(CircuitBreakerRegistry::new(defaults.breaker).with_events(events.clone())),
                fanout: defaults.fanout,
                cache_ttl: defaults.cache.ttl(),
                events,
            },
            flights: SingleFlight::new(),
        }
    }

    /// Orchestrator wired from service configuration
    pub fn from_config(
        config: &ServiceConfig,
        providers: Vec<Arc<dyn BookProvider>>,
        fast: Arc<dyn FastTier>,
        durable: Arc<dyn DurableTier>,
        events: EventBus,
    ) -> Self {
        let weights: BTreeMap<ProviderId, f64> = ProviderId::ALL
            .iter()
            .map(|p| (*p, config.providers.trust_weight(*p)))
            .collect();
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone()).with_events(events.clone());

        Self::new(providers, fast, durable, events)
            .with_merger(BookMerger::new(weights))
            .with_breakers(Arc::new(breakers))
            .with_fanout(config.fanout.clone())
            .with_cache_ttl(config.cache.ttl())
    }

    pub fn with_merger(mut self, merger: BookMerger) -> Self {
        self.core.merger = Arc::new(merger);
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.core.breakers = breakers;
        self
    }

    pub fn with_fanout(mut self, fanout: FanoutConfig) -> Self {
        self.core.fanout = fanout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.core.cache_ttl = ttl;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.core.breakers
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.core.providers.iter().map(|p| p.id()).collect()
    }

    /// Resolve one intent to its best book
    ///
    /// Searches return the top-ranked result; identifier lookups return the
    /// merged book carrying that identifier.
    pub async fn lookup(&self, intent: LookupIntent) -> Result<Book, LookupError> {
        match intent {
            LookupIntent::Search(query) => self
                .search(query)
                .await?
                .into_iter()
                .next()
                .ok_or(LookupError::NotFound),
            LookupIntent::Identifier { id } => self.lookup_identifier(id).await,
        }
    }

    /// Ranked, filtered search results
    pub async fn search(&self, query: SearchQuery) -> Result<Vec<Book>, LookupError> {
        query.validate()?;
        let started = Instant::now();
        let fingerprint = query.fingerprint();
        let intent = LookupIntent::Search(query);
        let key = intent.flight_key();

        log_stage(&key, LookupStage::CacheCheck);
        match self.core.fast.get(&fingerprint).await {
            Ok(Some(books)) if !books.is_empty() => {
                log_stage(&key, LookupStage::Done);
                self.core.completed(&key, "fast_tier", books.len(), started);
                return Ok(books);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Fast tier unavailable, bypassing"),
        }

        let core = self.core.clone();
        let flight_key = key.clone();
        let books = self
            .flights
            .run(&key, async move {
                let result = core.resolve(&flight_key, &intent).await;
                if let Ok(books) = &result {
                    if let Err(e) = core.fast.set(fingerprint, books.clone(), core.cache_ttl).await {
                        tracing::warn!(key = %flight_key, error = %e, "Fast tier write failed");
                    }
                }
                result
            })
            .await??;

        self.core.completed(&key, "providers", books.len(), started);
        Ok(books)
    }

    async fn lookup_identifier(&self, id: BookIdentifier) -> Result<Book, LookupError> {
        let started = Instant::now();
        let intent = LookupIntent::identifier(id.clone());
        let key = intent.flight_key();

        log_stage(&key, LookupStage::CacheCheck);
        match self.core.durable.get(&id).await {
            Ok(Some(book)) => {
                log_stage(&key, LookupStage::Done);
                self.core.completed(&key, "durable_tier", 1, started);
                return Ok(book);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Durable tier unavailable, bypassing"),
        }

        let core = self.core.clone();
        let flight_key = key.clone();
        let books = self
            .flights
            .run(&key, async move { core.resolve(&flight_key, &intent).await })
            .await??;

        self.core.completed(&key, "providers", books.len(), started);
        books
            .into_iter()
            .find(|b| b.has_identifier(&id))
            .ok_or(LookupError::NotFound)
    }

    /// Drop one identifier from both tiers; true if the durable tier held it
    pub async fn invalidate(&self, id: &BookIdentifier) -> bool {
        let removed = match self.core.durable.invalidate(id).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(identifier = %id, error = %e, "Durable invalidation failed");
                false
            }
        };
        match self.core.fast.invalidate_identifier(id).await {
            Ok(entries) => tracing::info!(identifier = %id, durable = removed, fast_entries = entries, "Cache invalidated"),
            Err(e) => tracing::warn!(identifier = %id, error = %e, "Fast tier invalidation failed"),
        }
        self.core.events.emit_lossy(LibrisEvent::CacheInvalidated {
            scope: id.to_string(),
            timestamp: Utc::now(),
        });
        removed
    }

    /// Empty both tiers; returns the number of durable books removed
    pub async fn invalidate_all(&self) -> u64 {
        let removed = match self.core.durable.invalidate_all().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Durable invalidation failed");
                0
            }
        };
        if let Err(e) = self.core.fast.clear().await {
            tracing::warn!(error = %e, "Fast tier clear failed");
        }
        tracing::info!(durable_removed = removed, "All caches invalidated");
        self.core.events.emit_lossy(LibrisEvent::CacheInvalidated {
            scope: "all".to_string(),
            timestamp: Utc::now(),
        });
        removed
    }

    /// Live fast-tier entries
    pub async fn fast_entries(&self) -> Vec<FastEntrySummary> {
        self.core.fast.inspect().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Fast tier inspection failed");
            Vec::new()
        })
    }
}

#[async_trait]
impl BookLookup for AggregationOrchestrator {
    async fn lookup(&self, intent: LookupIntent) -> Result<Book, LookupError> {
        AggregationOrchestrator::lookup(self, intent).await
    }
}

impl Core {
    fn completed(&self, key: &str, source: &str, result_count: usize, started: Instant) {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(key = %key, source, result_count, duration_ms, "Lookup completed");
        self.events.emit_lossy(LibrisEvent::LookupCompleted {
            key: key.to_string(),
            source: source.to_string(),
            result_count,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    /// Fanout, merge and durable persist for one intent
    async fn resolve(&self, key: &str, intent: &LookupIntent) -> FlightResult {
        log_stage(key, LookupStage::Fanout);
        let outcome = match self.fanout(intent).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log_stage(key, LookupStage::Failed);
                return Err(e.into());
            }
        };

        if outcome.partials.is_empty() {
            if outcome.failures.len() == outcome.called {
                log_stage(key, LookupStage::Failed);
                return Err(AggregationError::AllProvidersFailed {
                    failures: outcome.failures,
                }
                .into());
            }
            // Negative results are never cached
            log_stage(key, LookupStage::Done);
            return Err(LookupError::NotFound);
        }

        log_stage(key, LookupStage::Merge);
        let mut merged = self.merger.merge_all(outcome.partials, Utc::now());

        // A provider may answer under a different id (e.g. a newer edition).
        // The requested id joins the record so the next lookup hits the
        // durable tier; with several candidates there is no safe choice.
        if let LookupIntent::Identifier { id } = intent {
            if !merged.iter().any(|b| b.has_identifier(id)) {
                match merged.as_mut_slice() {
                    [only] => {
                        tracing::debug!(key = %key, identifier = %id, title = %only.title, "Attaching requested identifier");
                        only.identifiers.insert(id.clone());
                    }
                    _ => {
                        tracing::debug!(key = %key, candidates = merged.len(), "No record carries the requested identifier");
                        log_stage(key, LookupStage::Done);
                        return Err(LookupError::NotFound);
                    }
                }
            }
        }

        log_stage(key, LookupStage::Persist);
        let mut books = Vec::with_capacity(merged.len());
        for book in merged {
            match self.durable.upsert(book.clone()).await {
                Ok(stored) => books.push(stored),
                Err(e) => {
                    tracing::warn!(key = %key, title = %book.title, error = %e, "Durable write failed, serving fresh merge");
                    books.push(book);
                }
            }
        }

        if let LookupIntent::Search(query) = intent {
            books = apply_filters(books, &query.filters);
        }

        if books.is_empty() {
            log_stage(key, LookupStage::Done);
            return Err(LookupError::NotFound);
        }

        log_stage(key, LookupStage::Done);
        Ok(books)
    }

    /// Providers this intent may be sent to, before breaker checks
    fn eligible(&self, intent: &LookupIntent) -> Vec<Arc<dyn BookProvider>> {
        let subset: Option<&BTreeSet<ProviderId>> = match intent {
            LookupIntent::Search(query) => query.filters.providers.as_ref(),
            LookupIntent::Identifier { .. } => None,
        };
        self.providers
            .iter()
            .filter(|p| p.supports(intent))
            .filter(|p| subset.map(|s| s.contains(&p.id())).unwrap_or(true))
            .cloned()
            .collect()
    }

    async fn fanout(&self, intent: &LookupIntent) -> Result<FanoutOutcome, AggregationError> {
        let admitted: Vec<Arc<dyn BookProvider>> = self
            .eligible(intent)
            .into_iter()
            .filter(|p| {
                let ok = self.breakers.try_acquire(p.id());
                if !ok {
                    tracing::debug!(provider = %p.id(), "Skipping provider with open circuit");
                }
                ok
            })
            .collect();

        if admitted.is_empty() {
            return Err(AggregationError::NoActiveProviders);
        }

        let request_id = Uuid::new_v4();
        let fanout_started = Instant::now();
        let deadline = fanout_started + self.fanout.aggregate_deadline(admitted.iter().map(|p| p.timeout()));

        let mut pending: FuturesUnordered<_> = admitted
            .iter()
            .map(|provider| {
                let provider = Arc::clone(provider);
                async move {
                    let started = Instant::now();
                    let budget = provider.timeout();
                    let result = match tokio::time::timeout(budget, provider.fetch(intent, budget)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout),
                    };
                    (provider.id(), result, started.elapsed())
                }
            })
            .collect();

        let mut outstanding: BTreeSet<ProviderId> = admitted.iter().map(|p| p.id()).collect();
        let mut outcome = FanoutOutcome {
            called: admitted.len(),
            ..Default::default()
        };

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((provider, result, elapsed))) => {
                    outstanding.remove(&provider);
                    self.record(request_id, provider, result, elapsed, &mut outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    for provider in std::mem::take(&mut outstanding) {
                        tracing::warn!(provider = %provider, "Provider missed the aggregate deadline");
                        self.record(
                            request_id,
                            provider,
                            Err(ProviderError::Timeout),
                            fanout_started.elapsed(),
                            &mut outcome,
                        );
                    }
                    break;
                }
            }
        }

        tracing::debug!(
            request_id = %request_id,
            providers = outcome.called,
            partials = outcome.partials.len(),
            failures = outcome.failures.len(),
            elapsed_ms = fanout_started.elapsed().as_millis() as u64,
            "Fanout finished"
        );
        Ok(outcome)
    }

    fn record(
        &self,
        request_id: Uuid,
        provider: ProviderId,
        result: Result<Vec<PartialBook>, ProviderError>,
        elapsed: Duration,
        outcome: &mut FanoutOutcome,
    ) {
        let (status, result_count) = match result {
            Ok(partials) => {
                self.breakers.record_success(provider);
                let count = partials.len();
                outcome.partials.extend(partials);
                (if count == 0 { "not_found" } else { "success" }, count)
            }
            Err(error) => {
                self.breakers.record_failure(provider, &error);
                let status = error.status_label();
                if error.is_failure() {
                    tracing::warn!(provider = %provider, error = %error, "Provider call failed");
                    outcome.failures.push((provider, error));
                }
                (status, 0)
            }
        };

        self.events.emit_lossy(LibrisEvent::ProviderCall {
            request_id,
            provider: provider.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            result_count,
            status: status.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Apply rating/language filters and the result limit
///
/// A book without a rating never satisfies `min_rating`; a book without a
/// language never satisfies `language`.
pub fn apply_filters(books: Vec<Book>, filters: &LookupFilters) -> Vec<Book> {
    let language = filters.language.as_deref().map(normalize::normalize_language);
    let mut kept: Vec<Book> = books
        .into_iter()
        .filter(|b| match filters.min_rating {
            Some(min) => b.rating.map(|r| r >= min).unwrap_or(false),
            None => true,
        })
        .filter(|b| match &language {
            Some(lang) => b.language.as_deref() == Some(lang.as_str()),
            None => true,
        })
        .collect();
    if let Some(limit) = filters.limit {
        kept.truncate(limit);
    }
    kept
}

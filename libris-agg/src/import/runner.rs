//! Import job runner
//!
//! Each submitted job runs on its own task:
//!
//! 1. `queued` row persisted on submission
//! 2. `running`; pages fetched under the source's minimum interval
//! 3. every item looked up through `BookLookup`; progress persisted and
//!    broadcast after each one. A failed progress write is logged and the
//!    next one carries the full state, so the job keeps going
//! 4. `completed`, or `partial` when any item failed, pagination broke off
//!    or the job was cancelled; `failed` when the first page is unreachable
//!
//! Cancellation is cooperative: checked between pages and between items.

use super::job::{ImportJob, JobStatus};
use super::sources::{ListItem, ListSource, ListSourceFactory};
use super::JobError;
use crate::config::ImportConfig;
use crate::db::jobs::{list_jobs, load_job, save_job};
use crate::orchestrator::BookLookup;
use chrono::Utc;
use libris_common::{EventBus, LibrisEvent};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CANCELLED: &str = "cancelled";

/// State shared by the runner and its job tasks
#[derive(Clone)]
struct RunContext {
    pool: SqlitePool,
    lookup: Arc<dyn BookLookup>,
    config: ImportConfig,
    events: EventBus,
}

pub struct JobRunner {
    ctx: RunContext,
    sources: Arc<dyn ListSourceFactory>,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl JobRunner {
    pub fn new(
        pool: SqlitePool,
        lookup: Arc<dyn BookLookup>,
        sources: Arc<dyn ListSourceFactory>,
        config: ImportConfig,
        events: EventBus,
    ) -> Self {
        Self {
            ctx: RunContext {
                pool,
                lookup,
                config,
                events,
            },
            sources,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue an import of `url`; the job runs in the background
    pub async fn submit(&self, url: &str) -> Result<Uuid, JobError> {
        let url = url.trim();
        let source = self.sources.source_for(url)?;

        let job = ImportJob::new(url);
        let job_id = job.job_id;
        save_job(&self.ctx.pool, &job).await?;
        self.ctx.emit_progress(&job);

        let token = CancellationToken::new();
        self.active().insert(job_id, token.clone());

        tracing::info!(job_id = %job_id, url = %url, source = source.name(), "Import job queued");

        let ctx = self.ctx.clone();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            ctx.run(job, source, token).await;
            active.lock().unwrap_or_else(|p| p.into_inner()).remove(&job_id);
        });

        Ok(job_id)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<ImportJob>, JobError> {
        Ok(load_job(&self.ctx.pool, job_id).await?)
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<ImportJob>, JobError> {
        Ok(list_jobs(&self.ctx.pool, limit).await?)
    }

    /// Request cancellation; false when the job is not running here
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.active().get(&job_id) {
            Some(token) => {
                tracing::info!(job_id = %job_id, "Import job cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.active().len()
    }

    /// Cancel every running job
    pub fn shutdown(&self) {
        for token in self.active().values() {
            token.cancel();
        }
    }

    /// Poll until the job reaches a terminal status or `timeout` passes
    pub async fn wait_for(&self, job_id: Uuid, timeout: Duration) -> Result<Option<ImportJob>, JobError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.status(job_id).await?;
            let settled = job.as_ref().map(|j| j.status.is_terminal()).unwrap_or(true);
            if settled || tokio::time::Instant::now() >= deadline {
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl RunContext {
    fn emit_progress(&self, job: &ImportJob) {
        self.events.emit_lossy(LibrisEvent::ImportJobProgress {
            job_id: job.job_id,
            status: job.status.to_string(),
            discovered: job.discovered,
            imported: job.imported,
            failed: job.failed_count(),
            timestamp: Utc::now(),
        });
    }

    async fn persist(&self, job: &ImportJob) -> Result<(), JobError> {
        save_job(&self.pool, job).await?;
        self.emit_progress(job);
        Ok(())
    }

    /// Progress save mid-run; never ends the job
    async fn checkpoint(&self, job: &ImportJob) {
        if let Err(e) = save_job(&self.pool, job).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to persist job progress, continuing");
        }
        self.emit_progress(job);
    }

    async fn run(&self, mut job: ImportJob, source: Arc<dyn ListSource>, token: CancellationToken) {
        let job_id = job.job_id;
        if let Err(e) = self.execute(&mut job, source.as_ref(), &token).await {
            tracing::error!(job_id = %job_id, error = %e, "Import job failed");
            job.last_error = Some(e.to_string());
            job.transition_to(JobStatus::Failed);
            if let Err(e) = self.persist(&job).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to persist failed job");
            }
        }
    }

    async fn execute(
        &self,
        job: &mut ImportJob,
        source: &dyn ListSource,
        token: &CancellationToken,
    ) -> Result<(), JobError> {
        job.transition_to(JobStatus::Running);
        self.persist(job).await?;
        tracing::info!(job_id = %job.job_id, source = source.name(), "Import job started");

        let mut next_url = Some(job.source_url.clone());
        let mut pages = 0usize;
        let mut item_index = 0usize;
        let mut seen: HashSet<String> = HashSet::new();
        let mut interrupted = false;
        let mut cancelled = false;

        'pages: while let Some(page_url) = next_url.take() {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            if pages >= self.config.scrape_limit_pages {
                tracing::info!(job_id = %job.job_id, pages, "Page limit reached, stopping pagination");
                break;
            }

            let fetched = tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                    break 'pages;
                }
                result = tokio::time::timeout(self.config.page_timeout(), source.fetch_page(&page_url)) => result,
            };

            let page = match fetched {
                Ok(Ok(page)) => page,
                Ok(Err(e)) if pages == 0 => return Err(JobError::SourceUnreachable(e.to_string())),
                Err(_) if pages == 0 => return Err(JobError::SourceUnreachable("list page timed out".to_string())),
                failed => {
                    let reason = match failed {
                        Ok(Err(e)) => e.to_string(),
                        _ => "timed out".to_string(),
                    };
                    tracing::warn!(job_id = %job.job_id, page = pages + 1, error = %reason, "List page unreachable, stopping pagination");
                    job.last_error = Some(format!("page {} unreachable: {}", pages + 1, reason));
                    interrupted = true;
                    break;
                }
            };
            pages += 1;

            if pages == 1 {
                if page.items.is_empty() {
                    return Err(JobError::SourceUnreachable("no items found at list url".to_string()));
                }
                job.list_title = page.title.clone();
            }

            let items: Vec<ListItem> = page
                .items
                .into_iter()
                .filter(|item| seen.insert(item.item_ref.clone()))
                .collect();
            job.discovered += items.len();
            self.checkpoint(job).await;
            tracing::debug!(job_id = %job.job_id, page = pages, items = items.len(), "List page scraped");

            for item in items {
                if token.is_cancelled() {
                    cancelled = true;
                    break 'pages;
                }
                item_index += 1;

                match self.lookup.lookup(item.intent).await {
                    Ok(book) => {
                        tracing::debug!(job_id = %job.job_id, item = item_index, title = %book.title, "Item imported");
                        job.record_imported();
                    }
                    Err(e) => {
                        let failure = JobError::ItemFailed {
                            index: item_index,
                            reason: e.to_string(),
                        };
                        tracing::warn!(job_id = %job.job_id, item_ref = %item.item_ref, error = %failure, "Import item failed");
                        job.record_failure(item_index, item.item_ref, e.to_string());
                    }
                }
                self.checkpoint(job).await;
            }

            next_url = page.next_url;
        }

        let status = job.settled_status(interrupted || cancelled);
        if cancelled {
            job.last_error = Some(CANCELLED.to_string());
        }
        job.transition_to(status);
        if let Err(e) = self.persist(job).await {
            tracing::error!(job_id = %job.job_id, status = %job.status, error = %e, "Failed to persist finished job");
        }

        tracing::info!(
            job_id = %job.job_id,
            status = %job.status,
            discovered = job.discovered,
            imported = job.imported,
            failed = job.failed_count(),
            "Import job finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use crate::fusion::BookMerger;
    use crate::import::sources::ListPage;
    use crate::types::{Book, BookIdentifier, LookupError, LookupIntent, PartialBook, ProviderError, ProviderId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pages served from memory; `fail_from` makes that page index and later fail
    struct ScriptedSource {
        pages: Vec<ListPage>,
        fail_from: Option<usize>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ListSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_page(&self, url: &str) -> Result<ListPage, ProviderError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let index: usize = url.rsplit('=').next().and_then(|n| n.parse().ok()).unwrap_or(0);
            if self.fail_from.map(|f| index >= f).unwrap_or(false) {
                return Err(ProviderError::Unavailable("503".to_string()));
            }
            self.pages
                .get(index)
                .cloned()
                .ok_or(ProviderError::NotFound)
        }
    }

    struct Factory(Arc<ScriptedSource>);

    impl ListSourceFactory for Factory {
        fn source_for(&self, url: &str) -> Result<Arc<dyn ListSource>, JobError> {
            if url.starts_with("mem://") {
                Ok(self.0.clone())
            } else {
                Err(JobError::UnsupportedSource(url.to_string()))
            }
        }
    }

    /// Resolves every catalog identifier except the ones listed
    struct ScriptedLookup {
        missing: HashSet<String>,
        delay: Duration,
    }

    #[async_trait]
    impl BookLookup for ScriptedLookup {
        async fn lookup(&self, intent: LookupIntent) -> Result<Book, LookupError> {
            tokio::time::sleep(self.delay).await;
            let LookupIntent::Identifier { id } = intent else {
                return Err(LookupError::NotFound);
            };
            if self.missing.contains(&id.value) {
                return Err(LookupError::NotFound);
            }
            let mut p = PartialBook::new(ProviderId::Catalog, id.value.clone());
            p.title = Some(format!("Book {}", id.value));
            BookMerger::default().merge(&[p]).ok_or(LookupError::NotFound)
        }
    }

    fn page(range: std::ops::Range<usize>, next: Option<usize>) -> ListPage {
        ListPage {
            title: Some("Scripted List".to_string()),
            items: range
                .map(|n| {
                    let id = BookIdentifier::new(ProviderId::Catalog, format!("B0{:08}", n));
                    ListItem {
                        item_ref: id.to_string(),
                        intent: LookupIntent::identifier(id),
                    }
                })
                .collect(),
            next_url: next.map(|n| format!("mem://list?page={}", n)),
        }
    }

    async fn runner(source: ScriptedSource, missing: &[&str], delay: Duration) -> (JobRunner, Arc<ScriptedSource>) {
        let pool = init_memory_pool().await.unwrap();
        let source = Arc::new(source);
        let lookup = ScriptedLookup {
            missing: missing.iter().map(|s| s.to_string()).collect(),
            delay,
        };
        let runner = JobRunner::new(
            pool,
            Arc::new(lookup),
            Arc::new(Factory(Arc::clone(&source))),
            ImportConfig::default(),
            EventBus::new(256),
        );
        (runner, source)
    }

    #[tokio::test]
    async fn test_paginates_and_completes() {
        let source = ScriptedSource {
            pages: vec![page(1..4, Some(1)), page(4..6, None)],
            fail_from: None,
            fetches: AtomicUsize::new(0),
        };
        let (runner, source) = runner(source, &[], Duration::ZERO).await;

        let job_id = runner.submit("mem://list?page=0").await.unwrap();
        let job = runner.wait_for(job_id, Duration::from_secs(5)).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.discovered, 5);
        assert_eq!(job.imported, 5);
        assert_eq!(job.list_title.as_deref(), Some("Scripted List"));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_item_failure_makes_job_partial() {
        let source = ScriptedSource {
            pages: vec![page(1..11, None)],
            fail_from: None,
            fetches: AtomicUsize::new(0),
        };
        let (runner, _) = runner(source, &["B000000004"], Duration::ZERO).await;

        let job_id = runner.submit("mem://list?page=0").await.unwrap();
        let job = runner.wait_for(job_id, Duration::from_secs(5)).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.imported, 9);
        assert_eq!(job.failures.len(), 1);
        assert_eq!(job.failures[0].item_index, 4);
        assert_eq!(job.failures[0].item_ref, "catalog:B000000004");
    }

    #[tokio::test]
    async fn test_unreachable_first_page_fails_job() {
        let source = ScriptedSource {
            pages: vec![page(1..3, None)],
            fail_from: Some(0),
            fetches: AtomicUsize::new(0),
        };
        let (runner, _) = runner(source, &[], Duration::ZERO).await;

        let job_id = runner.submit("mem://list?page=0").await.unwrap();
        let job = runner.wait_for(job_id, Duration::from_secs(5)).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_later_page_failure_stops_pagination() {
        let source = ScriptedSource {
            pages: vec![page(1..3, Some(1)), page(3..5, None)],
            fail_from: Some(1),
            fetches: AtomicUsize::new(0),
        };
        let (runner, _) = runner(source, &[], Duration::ZERO).await;

        let job_id = runner.submit("mem://list?page=0").await.unwrap();
        let job = runner.wait_for(job_id, Duration::from_secs(5)).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.imported, 2);
        assert!(job.failures.is_empty());
        assert!(job.last_error.unwrap().starts_with("page 2 unreachable"));
    }

    /// Takes the job table away during lookups `from..until`
    struct StoreOutage {
        inner: ScriptedLookup,
        pool: SqlitePool,
        calls: AtomicUsize,
        from: usize,
        until: usize,
    }

    #[async_trait]
    impl BookLookup for StoreOutage {
        async fn lookup(&self, intent: LookupIntent) -> Result<Book, LookupError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.from {
                sqlx::query("ALTER TABLE import_jobs RENAME TO import_jobs_offline")
                    .execute(&self.pool)
                    .await
                    .unwrap();
            } else if call == self.until {
                sqlx::query("ALTER TABLE import_jobs_offline RENAME TO import_jobs")
                    .execute(&self.pool)
                    .await
                    .unwrap();
            }
            self.inner.lookup(intent).await
        }
    }

    #[tokio::test]
    async fn test_progress_write_failures_do_not_stop_job() {
        let pool = init_memory_pool().await.unwrap();
        let source = Arc::new(ScriptedSource {
            pages: vec![page(1..11, None)],
            fail_from: None,
            fetches: AtomicUsize::new(0),
        });
        let lookup = Arc::new(StoreOutage {
            inner: ScriptedLookup {
                missing: HashSet::new(),
                delay: Duration::ZERO,
            },
            pool: pool.clone(),
            calls: AtomicUsize::new(0),
            from: 3,
            until: 6,
        });
        let runner = JobRunner::new(
            pool,
            lookup.clone(),
            Arc::new(Factory(source)),
            ImportConfig::default(),
            EventBus::new(256),
        );

        let job_id = runner.submit("mem://list?page=0").await.unwrap();
        // Status reads would fail during the outage, so wait on the task instead
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while runner.active_jobs() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = runner.status(job_id).await.unwrap().unwrap();

        assert_eq!(lookup.calls.load(Ordering::SeqCst), 10);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.imported, 10);
        assert!(job.failures.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_items() {
        let source = ScriptedSource {
            pages: vec![page(1..200, None)],
            fail_from: None,
            fetches: AtomicUsize::new(0),
        };
        let (runner, _) = runner(source, &[], Duration::from_millis(10)).await;

        let job_id = runner.submit("mem://list?page=0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.cancel(job_id));

        let job = runner.wait_for(job_id, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.last_error.as_deref(), Some("cancelled"));
        assert!(job.imported < 199);
    }

    #[tokio::test]
    async fn test_unsupported_url_is_rejected() {
        let source = ScriptedSource {
            pages: vec![],
            fail_from: None,
            fetches: AtomicUsize::new(0),
        };
        let (runner, _) = runner(source, &[], Duration::ZERO).await;
        assert!(matches!(
            runner.submit("https://example.org/list").await,
            Err(JobError::UnsupportedSource(_))
        ));
        assert!(runner.recent(10).await.unwrap().is_empty());
    }
}

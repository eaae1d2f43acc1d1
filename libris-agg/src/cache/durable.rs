//! Durable tier: canonical books in SQLite, keyed by identifier
//!
//! `books` holds one JSON payload per logical work; `book_identifiers` maps
//! every known identifier to its book. An upsert whose identifiers touch
//! several stored books folds them into one record.

use super::CacheError;
use crate::fusion::reconcile;
use crate::types::{Book, BookIdentifier};
use crate::utils::{max_lock_wait_ms, retry_on_lock};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[async_trait]
pub trait DurableTier: Send + Sync {
    async fn get(&self, id: &BookIdentifier) -> Result<Option<Book>, CacheError>;

    /// Whole-record upsert by identifier-set union; returns the stored book
    async fn upsert(&self, book: Book) -> Result<Book, CacheError>;

    /// Remove the book owning this identifier; false when none did
    async fn invalidate(&self, id: &BookIdentifier) -> Result<bool, CacheError>;

    /// Remove every book; returns how many were removed
    async fn invalidate_all(&self) -> Result<u64, CacheError>;
}

pub struct SqliteBookStore {
    pool: SqlitePool,
}

impl SqliteBookStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn decode(payload: &str) -> Result<Book, CacheError> {
    Ok(serde_json::from_str(payload)?)
}

/// Upsert inside one transaction
async fn upsert_tx(pool: &SqlitePool, fresh: &Book) -> libris_common::Result<Book> {
    let mut tx = pool.begin().await?;

    // Stored books sharing any identifier, in first-seen order
    let mut existing_ids: Vec<String> = Vec::new();
    for id in &fresh.identifiers {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT book_id FROM book_identifiers WHERE identifier = ?")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(owner) = owner {
            if !existing_ids.contains(&owner) {
                existing_ids.push(owner);
            }
        }
    }

    let mut previous: Vec<Book> = Vec::new();
    for book_id in &existing_ids {
        let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM books WHERE book_id = ?")
            .bind(book_id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(payload) = payload {
            match serde_json::from_str::<Book>(&payload) {
                Ok(book) => previous.push(book),
                Err(e) => tracing::warn!(book_id = %book_id, error = %e, "Dropping corrupt stored book"),
            }
        }
    }

    // Oldest first, so the newest stored values sit closest to the fresh merge
    previous.sort_by_key(|b| b.last_refreshed);
    let mut merged = previous.iter().fold(None::<Book>, |acc, prev| {
        Some(match acc {
            None => prev.clone(),
            Some(older) => reconcile(&older, prev.clone()),
        })
    });
    let stored = match merged.take() {
        Some(prev) => reconcile(&prev, fresh.clone()),
        None => fresh.clone(),
    };

    let book_id = existing_ids
        .first()
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    for stale in existing_ids.iter().skip(1) {
        sqlx::query("DELETE FROM book_identifiers WHERE book_id = ?")
            .bind(stale)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM books WHERE book_id = ?")
            .bind(stale)
            .execute(&mut *tx)
            .await?;
    }

    let payload = serde_json::to_string(&stored)?;
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO books (book_id, title, payload, last_refreshed, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(book_id) DO UPDATE SET
            title = excluded.title,
            payload = excluded.payload,
            last_refreshed = excluded.last_refreshed,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&book_id)
    .bind(&stored.title)
    .bind(&payload)
    .bind(stored.last_refreshed.to_rfc3339())
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    for id in &stored.identifiers {
        sqlx::query(
            r#"
            INSERT INTO book_identifiers (identifier, provider, book_id) VALUES (?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET book_id = excluded.book_id
            "#,
        )
        .bind(id.to_string())
        .bind(id.provider.as_str())
        .bind(&book_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::debug!(
        book_id = %book_id,
        title = %stored.title,
        folded = existing_ids.len(),
        "Durable upsert"
    );
    Ok(stored)
}

#[async_trait]
impl DurableTier for SqliteBookStore {
    async fn get(&self, id: &BookIdentifier) -> Result<Option<Book>, CacheError> {
        let row = sqlx::query(
            r#"
            SELECT b.payload FROM books b
            JOIN book_identifiers i ON i.book_id = b.book_id
            WHERE i.identifier = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                decode(&payload).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, book: Book) -> Result<Book, CacheError> {
        let max_wait_ms = max_lock_wait_ms(&self.pool).await;
        let pool = &self.pool;
        let book = &book;
        let stored = retry_on_lock("durable_upsert", max_wait_ms, || upsert_tx(pool, book)).await?;
        Ok(stored)
    }

    async fn invalidate(&self, id: &BookIdentifier) -> Result<bool, CacheError> {
        let mut tx = self.pool.begin().await?;
        let owner: Option<String> =
            sqlx::query_scalar("SELECT book_id FROM book_identifiers WHERE identifier = ?")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let Some(book_id) = owner else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM book_identifiers WHERE book_id = ?")
            .bind(&book_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM books WHERE book_id = ?")
            .bind(&book_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn invalidate_all(&self) -> Result<u64, CacheError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM book_identifiers")
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM books")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }
}

//! Import job persistence
//!
//! Jobs are upserted whole after every processed item.

use crate::import::job::{ImportJob, ItemFailure, JobStatus};
use crate::utils::{max_lock_wait_ms, retry_on_lock};
use chrono::{DateTime, Utc};
use libris_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub async fn save_job(pool: &SqlitePool, job: &ImportJob) -> Result<()> {
    // Prepare all data before touching the pool
    let job_id = job.job_id.to_string();
    let failures = serde_json::to_string(&job.failures)
        .map_err(|e| Error::Internal(format!("Failed to serialize failures: {}", e)))?;
    let status = job.status.as_str();
    let discovered = job.discovered as i64;
    let imported = job.imported as i64;
    let created_at = job.created_at.to_rfc3339();
    let updated_at = job.updated_at.to_rfc3339();

    let max_wait_ms = max_lock_wait_ms(pool).await;

    retry_on_lock("save_job", max_wait_ms, || async {
        sqlx::query(
            r#"
            INSERT INTO import_jobs (
                job_id, source_url, list_title, status, discovered, imported,
                failures, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                list_title = excluded.list_title,
                status = excluded.status,
                discovered = excluded.discovered,
                imported = excluded.imported,
                failures = excluded.failures,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job_id)
        .bind(&job.source_url)
        .bind(&job.list_title)
        .bind(status)
        .bind(discovered)
        .bind(imported)
        .bind(&failures)
        .bind(&job.last_error)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp {}: {}", value, e)))
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<ImportJob> {
    let job_id: String = row.get("job_id");
    let status: String = row.get("status");
    let failures: String = row.get("failures");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(ImportJob {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| Error::Internal(format!("Invalid job id {}: {}", job_id, e)))?,
        source_url: row.get("source_url"),
        list_title: row.get("list_title"),
        status: status.parse::<JobStatus>().map_err(Error::Internal)?,
        discovered: row.get::<i64, _>("discovered") as usize,
        imported: row.get::<i64, _>("imported") as usize,
        failures: serde_json::from_str::<Vec<ItemFailure>>(&failures)?,
        last_error: row.get("last_error"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

pub async fn load_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<ImportJob>> {
    let row = sqlx::query("SELECT * FROM import_jobs WHERE job_id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_job).transpose()
}

/// Most recent jobs first
pub async fn list_jobs(pool: &SqlitePool, limit: i64) -> Result<Vec<ImportJob>> {
    let rows = sqlx::query("SELECT * FROM import_jobs ORDER BY created_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_job).collect()
}

/// Jobs left non-terminal by a previous process are marked failed on startup
pub async fn fail_orphaned_jobs(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE import_jobs
        SET status = 'failed', last_error = 'interrupted by restart', updated_at = ?
        WHERE status IN ('queued', 'running')
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

//! Provider call telemetry
//!
//! The orchestrator emits one `ProviderCall` event per adapter call; a
//! background recorder persists them and `summarize` aggregates per provider.

use chrono::{DateTime, Utc};
use libris_common::{EventBus, LibrisEvent, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCallRecord {
    pub request_id: Uuid,
    pub provider: String,
    pub status: String,
    pub duration_ms: f64,
    pub result_count: usize,
    pub called_at: DateTime<Utc>,
}

/// Aggregated figures for one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub calls: i64,
    pub successes: i64,
    pub not_found: i64,
    pub failures: i64,
    pub avg_duration_ms: f64,
    pub last_called_at: Option<String>,
}

pub async fn record_call(pool: &SqlitePool, record: &ProviderCallRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provider_calls (request_id, provider, status, duration_ms, result_count, called_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.request_id.to_string())
    .bind(&record.provider)
    .bind(&record.status)
    .bind(record.duration_ms)
    .bind(record.result_count as i64)
    .bind(record.called_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn summarize(pool: &SqlitePool) -> Result<Vec<ProviderStats>> {
    let rows = sqlx::query(
        r#"
        SELECT provider,
               COUNT(*) AS calls,
               SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END) AS successes,
               SUM(CASE WHEN status = 'not_found' THEN 1 ELSE 0 END) AS not_found,
               SUM(CASE WHEN status NOT IN ('success', 'not_found') THEN 1 ELSE 0 END) AS failures,
               AVG(duration_ms) AS avg_duration_ms,
               MAX(called_at) AS last_called_at
        FROM provider_calls
        GROUP BY provider
        ORDER BY provider
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ProviderStats {
            provider: row.get("provider"),
            calls: row.get("calls"),
            successes: row.get("successes"),
            not_found: row.get("not_found"),
            failures: row.get("failures"),
            avg_duration_ms: row.get::<Option<f64>, _>("avg_duration_ms").unwrap_or(0.0),
            last_called_at: row.get("last_called_at"),
        })
        .collect())
}

/// Persist every `ProviderCall` event until the bus closes
pub fn spawn_recorder(pool: SqlitePool, bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(LibrisEvent::ProviderCall {
                    request_id,
                    provider,
                    duration_ms,
                    result_count,
                    status,
                    timestamp,
                }) => {
                    let record = ProviderCallRecord {
                        request_id,
                        provider,
                        status,
                        duration_ms,
                        result_count,
                        called_at: timestamp,
                    };
                    if let Err(e) = record_call(&pool, &record).await {
                        tracing::warn!(error = %e, "Failed to record provider call");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Provider stats recorder lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Provider stats recorder stopped");
    })
}

//! Durable feed update records and the live per-feed status snapshot.
//!
//! The durable part is append-only: one row per runner invocation, keyed by
//! update_id and indexed by (system_id, feed_id, started_at_ms). The live
//! part is an in-memory snapshot owned by each ticker and rebuilt from the
//! latest records when a ticker is created.

use serde::Serialize;
use sqlx::SqlitePool;

use super::{FeedUpdate, UpdateStatus};
use crate::config::FeedConfig;

/// Append one attempt record.
pub async fn insert(pool: &SqlitePool, update: &FeedUpdate) -> Result<(), sqlx::Error> {
    let config_json = serde_json::to_string(&update.feed_config)
        .map_err(|e| sqlx::Error::Protocol(format!("serialize feed config: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO feed_updates
            (update_id, system_id, feed_id, started_at_ms, finished_at_ms, status,
             total_latency_ms, download_latency_ms, parse_latency_ms, database_latency_ms,
             download_http_status_code, content_length, content_hash, error_message, feed_config)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&update.update_id)
    .bind(&update.system_id)
    .bind(&update.feed_id)
    .bind(update.started_at_ms)
    .bind(update.finished_at_ms)
    .bind(update.status.as_str())
    .bind(update.total_latency_ms)
    .bind(update.download_latency_ms)
    .bind(update.parse_latency_ms)
    .bind(update.database_latency_ms)
    .bind(update.download_http_status_code.map(|c| c as i64))
    .bind(update.content_length)
    .bind(&update.content_hash)
    .bind(&update.error_message)
    .bind(config_json)
    .execute(pool)
    .await?;
    Ok(())
}

/// Content hash of the most recent successful attempt for a feed, if any.
/// Drives the runner's short-circuit.
pub async fn latest_successful_hash(
    pool: &SqlitePool,
    system_id: &str,
    feed_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT content_hash FROM feed_updates
        WHERE system_id = ? AND feed_id = ?
          AND status IN ('UPDATED', 'SKIPPED')
          AND content_hash IS NOT NULL
        ORDER BY started_at_ms DESC
        LIMIT 1
        "#,
    )
    .bind(system_id)
    .bind(feed_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(hash,)| hash))
}

/// Latest successful and latest finished timestamps for a feed, used to
/// seed a fresh ticker's live status after restart or reset.
pub async fn latest_times(
    pool: &SqlitePool,
    system_id: &str,
    feed_id: &str,
) -> Result<(Option<i64>, Option<i64>), sqlx::Error> {
    let last_successful: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT finished_at_ms FROM feed_updates
        WHERE system_id = ? AND feed_id = ?
          AND status IN ('UPDATED', 'SKIPPED')
          AND finished_at_ms IS NOT NULL
        ORDER BY finished_at_ms DESC
        LIMIT 1
        "#,
    )
    .bind(system_id)
    .bind(feed_id)
    .fetch_optional(pool)
    .await?;

    let last_finished: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT finished_at_ms FROM feed_updates
        WHERE system_id = ? AND feed_id = ?
          AND finished_at_ms IS NOT NULL
        ORDER BY finished_at_ms DESC
        LIMIT 1
        "#,
    )
    .bind(system_id)
    .bind(feed_id)
    .fetch_optional(pool)
    .await?;

    Ok((
        last_successful.map(|(ms,)| ms),
        last_finished.map(|(ms,)| ms),
    ))
}

/// Live status of one scheduled feed, maintained by its ticker and read by
/// the scheduler status endpoint. In-memory only.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct FeedStatus {
    pub system_id: String,
    pub feed_id: String,
    pub feed_config: FeedConfig,
    pub currently_running: bool,
    pub last_successful_update_ms: Option<i64>,
    pub last_finished_update_ms: Option<i64>,
    /// Next autonomous fire time; None for feeds with policy NONE.
    pub next_fire_ms: Option<i64>,
}

impl FeedStatus {
    /// Record a finished attempt. last_* timestamps never decrease.
    pub fn record_finished(&mut self, status: UpdateStatus, finished_at_ms: i64) {
        self.currently_running = false;
        if self.last_finished_update_ms.is_none_or(|prev| finished_at_ms >= prev) {
            self.last_finished_update_ms = Some(finished_at_ms);
        }
        if status.is_success()
            && self.last_successful_update_ms.is_none_or(|prev| finished_at_ms >= prev)
        {
            self.last_successful_update_ms = Some(finished_at_ms);
        }
    }
}

//! The feed runner: executes a single feed update attempt end-to-end.
//!
//! download -> hash -> short-circuit-if-unchanged -> parse -> persist,
//! producing exactly one [`FeedUpdate`] record per invocation. Failures
//! never escape as errors: every outcome is encoded in the record's status.

pub mod recorder;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::FeedConfig;
use crate::db::apply;
use crate::feeds::{ParseError, ParserRegistry};

/// Cap on the downloaded body size.
const MAX_DOWNLOAD_SIZE: usize = 100 * 1024 * 1024;
/// Cap on persisted error message length.
const MAX_ERROR_LEN: usize = 1024;

/// Terminal (and in-flight) status of a feed update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Running,
    Updated,
    Skipped,
    FailedDownloadError,
    FailedEmptyFeed,
    FailedUnknownFeedType,
    FailedInvalidFeedConfig,
    FailedParseError,
    FailedUpdateError,
    FailedInternalError,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStatus::Running => "RUNNING",
            UpdateStatus::Updated => "UPDATED",
            UpdateStatus::Skipped => "SKIPPED",
            UpdateStatus::FailedDownloadError => "FAILED_DOWNLOAD_ERROR",
            UpdateStatus::FailedEmptyFeed => "FAILED_EMPTY_FEED",
            UpdateStatus::FailedUnknownFeedType => "FAILED_UNKNOWN_FEED_TYPE",
            UpdateStatus::FailedInvalidFeedConfig => "FAILED_INVALID_FEED_CONFIG",
            UpdateStatus::FailedParseError => "FAILED_PARSE_ERROR",
            UpdateStatus::FailedUpdateError => "FAILED_UPDATE_ERROR",
            UpdateStatus::FailedInternalError => "FAILED_INTERNAL_ERROR",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "RUNNING" => UpdateStatus::Running,
            "UPDATED" => UpdateStatus::Updated,
            "SKIPPED" => UpdateStatus::Skipped,
            "FAILED_DOWNLOAD_ERROR" => UpdateStatus::FailedDownloadError,
            "FAILED_EMPTY_FEED" => UpdateStatus::FailedEmptyFeed,
            "FAILED_UNKNOWN_FEED_TYPE" => UpdateStatus::FailedUnknownFeedType,
            "FAILED_INVALID_FEED_CONFIG" => UpdateStatus::FailedInvalidFeedConfig,
            "FAILED_PARSE_ERROR" => UpdateStatus::FailedParseError,
            "FAILED_UPDATE_ERROR" => UpdateStatus::FailedUpdateError,
            _ => UpdateStatus::FailedInternalError,
        }
    }

    /// UPDATED and SKIPPED both mean the feed's content is fully reflected
    /// in the database.
    pub fn is_success(self) -> bool {
        matches!(self, UpdateStatus::Updated | UpdateStatus::Skipped)
    }
}

/// One feed update attempt. Immutable once finished and persisted.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct FeedUpdate {
    pub update_id: String,
    pub system_id: String,
    pub feed_id: String,
    /// Snapshot of the config this attempt ran with.
    pub feed_config: FeedConfig,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
    pub total_latency_ms: Option<i64>,
    pub download_latency_ms: Option<i64>,
    pub parse_latency_ms: Option<i64>,
    pub database_latency_ms: Option<i64>,
    pub download_http_status_code: Option<u16>,
    pub content_length: Option<i64>,
    pub content_hash: Option<String>,
    pub status: UpdateStatus,
    pub error_message: Option<String>,
}

impl FeedUpdate {
    pub fn begin(system_id: &str, config: &FeedConfig) -> Self {
        Self {
            update_id: Uuid::new_v4().to_string(),
            system_id: system_id.to_string(),
            feed_id: config.id.clone(),
            feed_config: config.clone(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            finished_at_ms: None,
            total_latency_ms: None,
            download_latency_ms: None,
            parse_latency_ms: None,
            database_latency_ms: None,
            download_http_status_code: None,
            content_length: None,
            content_hash: None,
            status: UpdateStatus::Running,
            error_message: None,
        }
    }

    pub fn finish(&mut self, status: UpdateStatus, error_message: Option<String>) {
        let finished = chrono::Utc::now().timestamp_millis();
        self.finished_at_ms = Some(finished);
        self.total_latency_ms = Some(finished - self.started_at_ms);
        self.status = status;
        self.error_message = error_message.map(|m| truncate_error(&m));
    }
}

fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_LEN).collect()
    }
}

/// Shared collaborators for running updates.
pub struct UpdateContext {
    pub pool: SqlitePool,
    pub client: reqwest::Client,
    pub registry: Arc<ParserRegistry>,
    pub parse_timeout: Duration,
    pub database_timeout: Duration,
}

/// Execute one feed update attempt to completion and persist its record.
///
/// Infallible from the caller's perspective: every failure mode is encoded
/// in the returned record's status and error message.
pub async fn run_update(
    ctx: &UpdateContext,
    system_id: &str,
    config: &FeedConfig,
    force: bool,
) -> FeedUpdate {
    let mut update = FeedUpdate::begin(system_id, config);
    let (status, error_message) = execute(ctx, &mut update, system_id, config, force).await;
    update.finish(status, error_message);

    if let Err(e) = recorder::insert(&ctx.pool, &update).await {
        error!(
            system_id,
            feed_id = %config.id,
            update_id = %update.update_id,
            error = %e,
            "Failed to persist feed update record"
        );
    }

    match update.status {
        UpdateStatus::Updated | UpdateStatus::Skipped => info!(
            system_id,
            feed_id = %config.id,
            status = update.status.as_str(),
            total_ms = update.total_latency_ms,
            "Feed update finished"
        ),
        _ => warn!(
            system_id,
            feed_id = %config.id,
            status = update.status.as_str(),
            error = update.error_message.as_deref().unwrap_or(""),
            "Feed update failed"
        ),
    }

    update
}

async fn execute(
    ctx: &UpdateContext,
    update: &mut FeedUpdate,
    system_id: &str,
    config: &FeedConfig,
    force: bool,
) -> (UpdateStatus, Option<String>) {
    // Download phase.
    let download_started = Instant::now();
    let mut request = ctx
        .client
        .get(&config.url)
        .timeout(Duration::from_millis(config.request_timeout_ms));
    for (name, value) in &config.http_headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            update.download_latency_ms = Some(download_started.elapsed().as_millis() as i64);
            return (
                UpdateStatus::FailedDownloadError,
                Some(format!("request failed: {}", e)),
            );
        }
    };

    let http_status = response.status();
    update.download_http_status_code = Some(http_status.as_u16());
    if !http_status.is_success() {
        update.download_latency_ms = Some(download_started.elapsed().as_millis() as i64);
        return (
            UpdateStatus::FailedDownloadError,
            Some(format!("HTTP {}", http_status)),
        );
    }

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            update.download_latency_ms = Some(download_started.elapsed().as_millis() as i64);
            return (
                UpdateStatus::FailedDownloadError,
                Some(format!("failed to read body: {}", e)),
            );
        }
    };
    update.download_latency_ms = Some(download_started.elapsed().as_millis() as i64);

    if body.len() > MAX_DOWNLOAD_SIZE {
        return (
            UpdateStatus::FailedDownloadError,
            Some(format!(
                "response too large: {} bytes (max {})",
                body.len(),
                MAX_DOWNLOAD_SIZE
            )),
        );
    }
    if body.is_empty() {
        return (UpdateStatus::FailedEmptyFeed, None);
    }

    let content_hash = format!("{:x}", Sha256::digest(&body));
    update.content_length = Some(body.len() as i64);
    update.content_hash = Some(content_hash.clone());

    // Hash short-circuit: identical content to the last success is a no-op
    // unless the caller forces a full run.
    if !force {
        match recorder::latest_successful_hash(&ctx.pool, system_id, &config.id).await {
            Ok(Some(previous)) if previous == content_hash => {
                return (UpdateStatus::Skipped, None);
            }
            Ok(_) => {}
            Err(e) => {
                // Treat a lookup failure as "no previous update" so a
                // transient read error cannot suppress a real update.
                warn!(system_id, feed_id = %config.id, error = %e, "Failed to look up last content hash");
            }
        }
    }

    // Parse phase.
    let Some(parser) = ctx.registry.get(&config.feed_type) else {
        return (
            UpdateStatus::FailedUnknownFeedType,
            Some(format!("no parser registered for type '{}'", config.feed_type)),
        );
    };

    let parse_started = Instant::now();
    let parse_body = body.clone();
    let parse_options = config.parser_options.clone();
    let parse_task =
        tokio::task::spawn_blocking(move || parser.parse(&parse_body, &parse_options));

    let parsed = match tokio::time::timeout(ctx.parse_timeout, parse_task).await {
        Err(_) => {
            update.parse_latency_ms = Some(parse_started.elapsed().as_millis() as i64);
            return (
                UpdateStatus::FailedInternalError,
                Some(format!(
                    "parse phase exceeded {}s",
                    ctx.parse_timeout.as_secs()
                )),
            );
        }
        Ok(Err(join_err)) => {
            update.parse_latency_ms = Some(parse_started.elapsed().as_millis() as i64);
            return (
                UpdateStatus::FailedInternalError,
                Some(format!("parser task failed: {}", join_err)),
            );
        }
        Ok(Ok(Err(ParseError::InvalidOptions(message)))) => {
            update.parse_latency_ms = Some(parse_started.elapsed().as_millis() as i64);
            // Install-time validation checks options, so this indicates a bug.
            return (
                UpdateStatus::FailedInvalidFeedConfig,
                Some(format!("parser rejected options: {}", message)),
            );
        }
        Ok(Ok(Err(e))) => {
            update.parse_latency_ms = Some(parse_started.elapsed().as_millis() as i64);
            return (UpdateStatus::FailedParseError, Some(e.to_string()));
        }
        Ok(Ok(Ok(parsed))) => parsed,
    };
    update.parse_latency_ms = Some(parse_started.elapsed().as_millis() as i64);

    // Database phase: one transaction, read-committed.
    let database_started = Instant::now();
    let apply_result = tokio::time::timeout(
        ctx.database_timeout,
        apply::apply_parsed(&ctx.pool, system_id, &config.id, &parsed),
    )
    .await;
    update.database_latency_ms = Some(database_started.elapsed().as_millis() as i64);

    match apply_result {
        Err(_) => (
            UpdateStatus::FailedInternalError,
            Some(format!(
                "database phase exceeded {}s",
                ctx.database_timeout.as_secs()
            )),
        ),
        Ok(Err(e)) => (
            UpdateStatus::FailedUpdateError,
            Some(format!("transaction failed: {}", e)),
        ),
        Ok(Ok(())) => (UpdateStatus::Updated, None),
    }
}

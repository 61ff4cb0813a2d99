//! Scheduler operations: manual feed updates, status, and reset.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::{conflict, internal_error, not_found, ApiError};
use super::AppState;
use crate::scheduler::TriggerError;
use crate::update::recorder::FeedStatus;
use crate::update::FeedUpdate;

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateFeedQuery {
    /// Bypass the content-hash short-circuit.
    #[serde(default)]
    pub force: bool,
}

/// Trigger a feed update now
///
/// Routes through the feed's ticker, so the at-most-one-in-flight rule
/// still applies: a second trigger while an update runs is rejected.
#[utoipa::path(
    post,
    path = "/systems/{system_id}/feeds/{feed_id}",
    params(
        ("system_id" = String, Path, description = "System ID"),
        ("feed_id" = String, Path, description = "Feed ID"),
        ("force" = bool, Query, description = "Bypass the content-hash short-circuit")
    ),
    responses(
        (status = 200, description = "The completed update attempt", body = FeedUpdate),
        (status = 404, description = "No such feed", body = super::error::ErrorResponse),
        (status = 409, description = "Update already in progress", body = super::error::ErrorResponse)
    ),
    tag = "scheduler"
)]
pub async fn update_feed(
    State(state): State<AppState>,
    Path((system_id, feed_id)): Path<(String, String)>,
    Query(query): Query<UpdateFeedQuery>,
) -> Result<Json<FeedUpdate>, ApiError> {
    match state
        .scheduler
        .trigger_update(&system_id, &feed_id, query.force)
        .await
    {
        Ok(update) => Ok(Json(update)),
        Err(e @ TriggerError::NoSuchFeed { .. }) => Err(not_found(e.to_string())),
        Err(e @ TriggerError::UpdateInProgress) => Err(conflict(e.to_string())),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SchedulerStatusResponse {
    pub feeds: Vec<FeedStatus>,
}

/// Live status of every scheduled feed
#[utoipa::path(
    get,
    path = "/scheduler",
    responses((status = 200, description = "Scheduler status", body = SchedulerStatusResponse)),
    tag = "scheduler"
)]
pub async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatusResponse> {
    Json(SchedulerStatusResponse {
        feeds: state.scheduler.status().await,
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetSchedulerResponse {
    /// Number of tickers after the rebuild.
    pub tickers: usize,
}

/// Stop every ticker and rebuild the scheduler from the database
#[utoipa::path(
    post,
    path = "/scheduler/reset",
    responses(
        (status = 200, description = "Scheduler rebuilt", body = ResetSchedulerResponse),
        (status = 500, description = "Rebuild failed", body = super::error::ErrorResponse)
    ),
    tag = "scheduler"
)]
pub async fn reset_scheduler(
    State(state): State<AppState>,
) -> Result<Json<ResetSchedulerResponse>, ApiError> {
    let tickers = state
        .scheduler
        .reset()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(ResetSchedulerResponse { tickers }))
}

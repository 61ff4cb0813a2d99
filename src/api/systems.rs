//! System install, update, inspection, and deletion.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use super::error::{bad_request, internal_error, not_found, ApiError};
use super::AppState;
use crate::config::SystemConfig;
use crate::db::{self, SystemStatus};
use crate::update::run_update;

#[derive(Debug, Deserialize, ToSchema)]
pub struct InstallSystemRequest {
    /// Raw YAML system configuration (may be a template).
    pub config: String,
    /// When true and the system is already installed, this is a no-op.
    #[serde(default)]
    pub install_only: bool,
    /// Arguments for `{{ key }}` markers in a template config.
    #[serde(default)]
    pub template_args: HashMap<String, String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SystemResponse {
    pub system_id: String,
    pub name: Option<String>,
    pub status: SystemStatus,
    pub feeds: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SystemConfigResponse {
    pub system_id: String,
    pub name: Option<String>,
    pub status: SystemStatus,
    pub config: SystemConfig,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteSystemResponse {
    pub system_id: String,
    pub deleted: bool,
}

/// Install or update a transit system
///
/// Validates the config, persists it, runs the initial update of every
/// `required_for_install` feed, and starts scheduling. If a required feed's
/// initial update fails, the system is marked INSTALL_FAILED and is not
/// scheduled; its partial update records are kept for diagnostics.
#[utoipa::path(
    put,
    path = "/systems/{system_id}",
    request_body = InstallSystemRequest,
    params(("system_id" = String, Path, description = "System ID")),
    responses(
        (status = 200, description = "System installed or updated", body = SystemResponse),
        (status = 400, description = "Invalid config or required feed failed", body = super::error::ErrorResponse)
    ),
    tag = "systems"
)]
pub async fn install_system(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
    Json(request): Json<InstallSystemRequest>,
) -> Result<Json<SystemResponse>, ApiError> {
    if system_id.is_empty() || !system_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(bad_request("system_id must be alphanumeric with - or _"));
    }

    // Validation happens before any state change.
    let config = SystemConfig::from_yaml(&request.config, &request.template_args)
        .map_err(|e| bad_request(e.to_string()))?;
    for feed in &config.feeds {
        // Unknown types are allowed through (build-time plug-in parsers);
        // known types must accept their options now rather than at update
        // time.
        if let Some(parser) = state.update_ctx.registry.get(&feed.feed_type) {
            parser.validate_options(&feed.parser_options).map_err(|e| {
                bad_request(format!("feed '{}': {}", feed.id, e))
            })?;
        }
    }

    let existing = db::get_system(&state.pool, &system_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    if request.install_only {
        if let Some(row) = &existing {
            if row.status == SystemStatus::Active {
                info!(system_id, "System already installed, skipping (install_only)");
                return Ok(Json(SystemResponse {
                    system_id,
                    name: row.name.clone(),
                    status: row.status,
                    feeds: config.feeds.len(),
                }));
            }
        }
    }

    let config_json =
        serde_json::to_string(&config).map_err(|e| internal_error(e.to_string()))?;
    db::upsert_system(
        &state.pool,
        &system_id,
        config.name.as_deref(),
        SystemStatus::Installing,
        &config_json,
    )
    .await
    .map_err(|e| internal_error(e.to_string()))?;
    db::replace_feeds(&state.pool, &system_id, &config.feeds)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    // Required feeds must complete their initial update before the system
    // becomes visible. Runs sequentially, in install order, bypassing the
    // hash short-circuit.
    for feed in config.feeds.iter().filter(|f| f.required_for_install) {
        let update = run_update(&state.update_ctx, &system_id, feed, true).await;
        if !update.status.is_success() {
            warn!(
                system_id,
                feed_id = %feed.id,
                status = update.status.as_str(),
                "Required feed failed its initial update, aborting install"
            );
            db::set_system_status(&state.pool, &system_id, SystemStatus::InstallFailed)
                .await
                .map_err(|e| internal_error(e.to_string()))?;
            // Stop any tickers left over from a previous install.
            state
                .scheduler
                .refresh_system(&system_id)
                .await
                .map_err(|e| internal_error(e.to_string()))?;
            return Err(bad_request(format!(
                "required feed '{}' failed its initial update: {}{}",
                feed.id,
                update.status.as_str(),
                update
                    .error_message
                    .as_deref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default(),
            )));
        }
    }

    db::set_system_status(&state.pool, &system_id, SystemStatus::Active)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    state
        .scheduler
        .refresh_system(&system_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    info!(system_id, feeds = config.feeds.len(), "System installed");
    Ok(Json(SystemResponse {
        system_id,
        name: config.name.clone(),
        status: SystemStatus::Active,
        feeds: config.feeds.len(),
    }))
}

/// Get a system's stored configuration
#[utoipa::path(
    get,
    path = "/systems/{system_id}",
    params(("system_id" = String, Path, description = "System ID")),
    responses(
        (status = 200, description = "System config", body = SystemConfigResponse),
        (status = 404, description = "No such system", body = super::error::ErrorResponse)
    ),
    tag = "systems"
)]
pub async fn get_system(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<Json<SystemConfigResponse>, ApiError> {
    let row = db::get_system(&state.pool, &system_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .ok_or_else(|| not_found(format!("no such system '{}'", system_id)))?;

    let config: SystemConfig = serde_json::from_str(&row.config)
        .map_err(|e| internal_error(format!("stored config is unreadable: {}", e)))?;

    Ok(Json(SystemConfigResponse {
        system_id: row.id,
        name: row.name,
        status: row.status,
        config,
    }))
}

/// Delete a system
///
/// Stops the system's tickers first (blocking until in-flight updates
/// finish), then removes its rows.
#[utoipa::path(
    delete,
    path = "/systems/{system_id}",
    params(("system_id" = String, Path, description = "System ID")),
    responses(
        (status = 200, description = "System deleted", body = DeleteSystemResponse),
        (status = 404, description = "No such system", body = super::error::ErrorResponse)
    ),
    tag = "systems"
)]
pub async fn delete_system(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<Json<DeleteSystemResponse>, ApiError> {
    let existing = db::get_system(&state.pool, &system_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    if existing.is_none() {
        return Err(not_found(format!("no such system '{}'", system_id)));
    }

    state.scheduler.delete_system(&system_id).await;
    db::delete_system(&state.pool, &system_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    info!(system_id, "System deleted");
    Ok(Json(DeleteSystemResponse {
        system_id,
        deleted: true,
    }))
}

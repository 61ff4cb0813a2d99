//! Health and runtime log-level endpoints.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{reload, EnvFilter, Registry};
use utoipa::ToSchema;

use super::error::{bad_request, ApiError};
use super::AppState;

/// Base directives appended to every filter so noisy dependencies stay
/// bounded regardless of the chosen level.
const FILTER_SUFFIX: &str = "tower_http=info,sqlx=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Handle to the process-wide log level. Wraps the subscriber's reloadable
/// filter plus the currently-set level for reads.
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    current: std::sync::Arc<std::sync::RwLock<LogLevel>>,
}

impl LogHandle {
    pub fn new(reload: reload::Handle<EnvFilter, Registry>) -> Self {
        Self {
            reload,
            current: std::sync::Arc::new(std::sync::RwLock::new(LogLevel::Info)),
        }
    }

    pub fn get(&self) -> LogLevel {
        self.current.read().map(|level| *level).unwrap_or(LogLevel::Info)
    }

    pub fn set(&self, level: LogLevel) -> Result<(), String> {
        let filter = EnvFilter::new(format!("{},{}", level.as_directive(), FILTER_SUFFIX));
        self.reload.reload(filter).map_err(|e| e.to_string())?;
        if let Ok(mut current) = self.current.write() {
            *current = level;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub healthy: bool,
    /// Whether the database answers queries.
    pub database_ok: bool,
    /// Number of live feed tickers.
    pub tickers: usize,
}

/// Service health
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service health", body = HealthResponse)),
    tag = "admin"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let tickers = state.scheduler.status().await.len();
    Json(HealthResponse {
        healthy: true,
        database_ok,
        tickers,
    })
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogLevelBody {
    pub level: LogLevel,
}

/// Current log level
#[utoipa::path(
    get,
    path = "/loglevel",
    responses((status = 200, description = "Current log level", body = LogLevelBody)),
    tag = "admin"
)]
pub async fn get_log_level(State(state): State<AppState>) -> Json<LogLevelBody> {
    Json(LogLevelBody {
        level: state.log.get(),
    })
}

/// Change the log level at runtime
#[utoipa::path(
    put,
    path = "/loglevel",
    request_body = LogLevelBody,
    responses(
        (status = 200, description = "Level applied", body = LogLevelBody),
        (status = 400, description = "Reload failed", body = super::error::ErrorResponse)
    ),
    tag = "admin"
)]
pub async fn set_log_level(
    State(state): State<AppState>,
    Json(body): Json<LogLevelBody>,
) -> Result<Json<LogLevelBody>, ApiError> {
    state
        .log
        .set(body.level)
        .map_err(|e| bad_request(format!("failed to set log level: {}", e)))?;
    Ok(Json(LogLevelBody { level: body.level }))
}

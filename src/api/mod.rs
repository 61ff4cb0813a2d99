//! Admin HTTP surface.
//!
//! One route per admin operation: install/update/delete/get system, trigger
//! a feed update, scheduler status and reset, health, and log level.

pub mod admin;
pub mod error;
pub mod scheduler;
pub mod systems;

pub use error::ErrorResponse;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use sqlx::SqlitePool;

use crate::scheduler::Scheduler;
use crate::update::UpdateContext;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub scheduler: Arc<Scheduler>,
    pub update_ctx: Arc<UpdateContext>,
    pub log: admin::LogHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/systems/{system_id}",
            put(systems::install_system)
                .get(systems::get_system)
                .delete(systems::delete_system),
        )
        .route(
            "/systems/{system_id}/feeds/{feed_id}",
            post(scheduler::update_feed),
        )
        .route("/scheduler", get(scheduler::scheduler_status))
        .route("/scheduler/reset", post(scheduler::reset_scheduler))
        .route(
            "/loglevel",
            get(admin::get_log_level).put(admin::set_log_level),
        )
        .route("/health", get(admin::health))
        .with_state(state)
}

mod api;
mod config;
mod db;
mod feeds;
mod scheduler;
mod update;

use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use api::admin::LogHandle;
use config::ServerConfig;
use feeds::ParserRegistry;
use scheduler::Scheduler;
use update::UpdateContext;

#[derive(OpenApi)]
#[openapi(
    info(title = "Headway Admin API", version = "0.1.0"),
    paths(
        api::systems::install_system,
        api::systems::get_system,
        api::systems::delete_system,
        api::scheduler::update_feed,
        api::scheduler::scheduler_status,
        api::scheduler::reset_scheduler,
        api::admin::health,
        api::admin::get_log_level,
        api::admin::set_log_level,
    ),
    components(schemas(
        api::ErrorResponse,
        api::systems::InstallSystemRequest,
        api::systems::SystemResponse,
        api::systems::SystemConfigResponse,
        api::systems::DeleteSystemResponse,
        api::scheduler::UpdateFeedQuery,
        api::scheduler::SchedulerStatusResponse,
        api::scheduler::ResetSchedulerResponse,
        api::admin::HealthResponse,
        api::admin::LogLevelBody,
        api::admin::LogLevel,
        config::SystemConfig,
        config::FeedConfig,
        config::SchedulingPolicy,
        db::SystemStatus,
        update::FeedUpdate,
        update::UpdateStatus,
        update::recorder::FeedStatus,
    )),
    tags(
        (name = "systems", description = "System install and lifecycle"),
        (name = "scheduler", description = "Feed update scheduling"),
        (name = "admin", description = "Health and runtime settings")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing with a reloadable filter so the log level can be
    // changed at runtime through the admin API.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,sqlx=warn"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
    let log_handle = LogHandle::new(reload_handle);

    // Load server config; a missing file means defaults.
    let config_path =
        std::env::var("HEADWAY_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        ServerConfig::load(&config_path).expect("Failed to load config")
    } else {
        tracing::info!(path = %config_path, "No config file found, using defaults");
        ServerConfig::default()
    };

    // Open the database and run migrations.
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(error = %e, "Could not create database directory");
        }
    }
    let pool = db::connect(&config.database_path)
        .await
        .expect("Failed to open database");
    tracing::info!(path = %config.database_path, "Database ready");

    // Shared collaborators for all feed updates.
    let update_ctx = Arc::new(UpdateContext {
        pool: pool.clone(),
        client: reqwest::Client::new(),
        registry: Arc::new(ParserRegistry::with_builtin()),
        parse_timeout: Duration::from_secs(config.parse_timeout_secs),
        database_timeout: Duration::from_secs(config.database_timeout_secs),
    });

    // Start scheduling every installed system.
    let scheduler = Arc::new(Scheduler::new(
        update_ctx.clone(),
        Duration::from_secs(config.update_timeout_secs),
    ));
    scheduler.start().await.expect("Failed to start scheduler");

    let state = api::AppState {
        pool,
        scheduler: scheduler.clone(),
        update_ctx,
        log: log_handle,
    };

    let app = axum::Router::new()
        .merge(api::router(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind {}: {}", config.http_addr, e));
    tracing::info!(addr = %config.http_addr, "Admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Drain in-flight feed updates before exiting.
    scheduler
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}

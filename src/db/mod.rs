//! Database access: pool setup, migrations, and the queries the scheduler
//! and admin API consume.

pub mod apply;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::FeedConfig;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if needed) the SQLite database at `path` and run
/// migrations.
pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let url = format!("sqlite:{}?mode=rwc", path);
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// Lifecycle status of an installed system. Only ACTIVE systems are
/// scheduled; INSTALLING and INSTALL_FAILED rows exist for diagnostics and
/// install atomicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    Installing,
    Active,
    InstallFailed,
}

impl SystemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemStatus::Installing => "INSTALLING",
            SystemStatus::Active => "ACTIVE",
            SystemStatus::InstallFailed => "INSTALL_FAILED",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "ACTIVE" => SystemStatus::Active,
            "INSTALLING" => SystemStatus::Installing,
            _ => SystemStatus::InstallFailed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemRow {
    pub id: String,
    pub name: Option<String>,
    pub status: SystemStatus,
    pub config: String,
    pub installed_at_ms: i64,
}

pub async fn upsert_system(
    pool: &SqlitePool,
    id: &str,
    name: Option<&str>,
    status: SystemStatus,
    config_json: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO systems (id, name, status, config, installed_at_ms)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            status = excluded.status,
            config = excluded.config
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(status.as_str())
    .bind(config_json)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_system_status(
    pool: &SqlitePool,
    id: &str,
    status: SystemStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE systems SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_system(pool: &SqlitePool, id: &str) -> Result<Option<SystemRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, status, config, installed_at_ms FROM systems WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| SystemRow {
        id: row.get("id"),
        name: row.get("name"),
        status: SystemStatus::from_db(row.get::<String, _>("status").as_str()),
        config: row.get("config"),
        installed_at_ms: row.get("installed_at_ms"),
    }))
}

/// IDs of all systems whose feeds are eligible for scheduling.
pub async fn list_active_systems(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM systems WHERE status = 'ACTIVE' ORDER BY id")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete a system and all its domain rows. Feed update history is kept:
/// the `feed_updates` table is append-only.
pub async fn delete_system(pool: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for table in [
        "feeds",
        "agencies",
        "routes",
        "stops",
        "trips",
        "stop_times",
        "trip_updates",
        "trip_stop_time_updates",
        "alerts",
        "systems",
    ] {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = ?",
            table,
            if table == "systems" { "id" } else { "system_id" }
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Replace the feed config rows for a system, preserving install order.
pub async fn replace_feeds(
    pool: &SqlitePool,
    system_id: &str,
    feeds: &[FeedConfig],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM feeds WHERE system_id = ?")
        .bind(system_id)
        .execute(&mut *tx)
        .await?;
    for (order, feed) in feeds.iter().enumerate() {
        let config_json = serde_json::to_string(feed)
            .map_err(|e| sqlx::Error::Protocol(format!("serialize feed config: {}", e)))?;
        sqlx::query(
            "INSERT INTO feeds (system_id, feed_id, config, install_order) VALUES (?, ?, ?, ?)",
        )
        .bind(system_id)
        .bind(&feed.id)
        .bind(config_json)
        .bind(order as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Feed configs for a system in install order. Rows whose JSON no longer
/// deserializes are skipped with a warning rather than failing the refresh.
pub async fn feeds_for_system(
    pool: &SqlitePool,
    system_id: &str,
) -> Result<Vec<(FeedConfig, usize)>, sqlx::Error> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        "SELECT feed_id, config, install_order FROM feeds WHERE system_id = ? ORDER BY install_order",
    )
    .bind(system_id)
    .fetch_all(pool)
    .await?;

    let mut feeds = Vec::with_capacity(rows.len());
    for (feed_id, config, install_order) in rows {
        match serde_json::from_str::<FeedConfig>(&config) {
            Ok(feed) => feeds.push((feed, install_order as usize)),
            Err(e) => {
                warn!(system_id, feed_id, error = %e, "Skipping feed with undeserializable config");
            }
        }
    }
    Ok(feeds)
}

/// The timezone of the lowest-ID agency with a valid IANA timezone, used to
/// resolve DAILY schedules for feeds that do not set one.
pub async fn first_valid_agency_timezone(
    pool: &SqlitePool,
    system_id: &str,
) -> Result<Option<chrono_tz::Tz>, sqlx::Error> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT agency_id, timezone FROM agencies WHERE system_id = ? ORDER BY agency_id",
    )
    .bind(system_id)
    .fetch_all(pool)
    .await?;

    for (agency_id, timezone) in rows {
        if let Some(raw) = timezone {
            match raw.parse::<chrono_tz::Tz>() {
                Ok(tz) => return Ok(Some(tz)),
                Err(_) => {
                    warn!(system_id, agency_id, timezone = %raw, "Agency has unparseable timezone");
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    MIGRATOR.run(&pool).await.unwrap();
    pool
}

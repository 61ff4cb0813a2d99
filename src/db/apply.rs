//! Transactional apply of parsed feed data to the domain tables.
//!
//! Each variant of [`ParsedFeed`] has its own strategy, but every apply runs
//! in exactly one transaction: either the whole parsed result lands or none
//! of it does.

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::feeds::{GtfsRealtimeData, GtfsStaticData, NyctStationRow, ParsedFeed};

pub async fn apply_parsed(
    pool: &SqlitePool,
    system_id: &str,
    feed_id: &str,
    parsed: &ParsedFeed,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    match parsed {
        ParsedFeed::GtfsStatic(data) => apply_static(&mut tx, system_id, data).await?,
        ParsedFeed::GtfsRealtime(data) => apply_realtime(&mut tx, system_id, feed_id, data).await?,
        ParsedFeed::NyctStations(rows) => apply_nyct_stations(&mut tx, system_id, rows).await?,
    }
    tx.commit().await?;
    Ok(())
}

/// Wipe and reload the system's schedule tables.
async fn apply_static(
    tx: &mut Transaction<'_, Sqlite>,
    system_id: &str,
    data: &GtfsStaticData,
) -> Result<(), sqlx::Error> {
    for table in ["stop_times", "trips", "stops", "routes", "agencies"] {
        sqlx::query(&format!("DELETE FROM {} WHERE system_id = ?", table))
            .bind(system_id)
            .execute(&mut **tx)
            .await?;
    }

    for agency in &data.agencies {
        sqlx::query(
            "INSERT INTO agencies (system_id, agency_id, name, url, timezone) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(system_id)
        .bind(agency.agency_id.as_deref().unwrap_or(&agency.agency_name))
        .bind(&agency.agency_name)
        .bind(&agency.agency_url)
        .bind(&agency.agency_timezone)
        .execute(&mut **tx)
        .await?;
    }

    for route in &data.routes {
        sqlx::query(
            r#"
            INSERT INTO routes (system_id, route_id, agency_id, short_name, long_name, route_type, color)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(system_id)
        .bind(&route.route_id)
        .bind(&route.agency_id)
        .bind(&route.route_short_name)
        .bind(&route.route_long_name)
        .bind(route.route_type)
        .bind(&route.route_color)
        .execute(&mut **tx)
        .await?;
    }

    for stop in &data.stops {
        sqlx::query(
            r#"
            INSERT INTO stops (system_id, stop_id, name, lat, lon, parent_station)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(system_id)
        .bind(&stop.stop_id)
        .bind(&stop.stop_name)
        .bind(stop.stop_lat)
        .bind(stop.stop_lon)
        .bind(&stop.parent_station)
        .execute(&mut **tx)
        .await?;
    }

    for trip in &data.trips {
        sqlx::query(
            r#"
            INSERT INTO trips (system_id, trip_id, route_id, service_id, headsign, direction_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(system_id)
        .bind(&trip.trip_id)
        .bind(&trip.route_id)
        .bind(&trip.service_id)
        .bind(&trip.trip_headsign)
        .bind(trip.direction_id)
        .execute(&mut **tx)
        .await?;
    }

    for st in &data.stop_times {
        sqlx::query(
            r#"
            INSERT INTO stop_times (system_id, trip_id, stop_sequence, stop_id, arrival_secs, departure_secs)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(system_id)
        .bind(&st.trip_id)
        .bind(st.stop_sequence)
        .bind(&st.stop_id)
        .bind(st.arrival_secs)
        .bind(st.departure_secs)
        .execute(&mut **tx)
        .await?;
    }

    debug!(
        system_id,
        routes = data.routes.len(),
        stops = data.stops.len(),
        trips = data.trips.len(),
        "Applied GTFS static data"
    );
    Ok(())
}

/// Replace the realtime rows produced by this feed. Rows are scoped by
/// `(system_id, source_feed_id)` so concurrent realtime feeds in the same
/// system do not clobber each other.
async fn apply_realtime(
    tx: &mut Transaction<'_, Sqlite>,
    system_id: &str,
    feed_id: &str,
    data: &GtfsRealtimeData,
) -> Result<(), sqlx::Error> {
    for table in ["trip_stop_time_updates", "trip_updates", "alerts"] {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE system_id = ? AND source_feed_id = ?",
            table
        ))
        .bind(system_id)
        .bind(feed_id)
        .execute(&mut **tx)
        .await?;
    }

    let now_ms = chrono::Utc::now().timestamp_millis();

    for tu in &data.trip_updates {
        sqlx::query(
            r#"
            INSERT INTO trip_updates
                (system_id, source_feed_id, trip_id, route_id, start_date, delay_secs, vehicle_id, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(system_id, source_feed_id, trip_id) DO UPDATE SET
                route_id = excluded.route_id,
                start_date = excluded.start_date,
                delay_secs = excluded.delay_secs,
                vehicle_id = excluded.vehicle_id,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(system_id)
        .bind(feed_id)
        .bind(&tu.trip_id)
        .bind(&tu.route_id)
        .bind(&tu.start_date)
        .bind(tu.delay_secs)
        .bind(&tu.vehicle_id)
        .bind(now_ms)
        .execute(&mut **tx)
        .await?;

        for stu in &tu.stop_time_updates {
            sqlx::query(
                r#"
                INSERT INTO trip_stop_time_updates
                    (system_id, source_feed_id, trip_id, stop_id, stop_sequence,
                     arrival_time, arrival_delay_secs, departure_time, departure_delay_secs, skipped)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(system_id)
            .bind(feed_id)
            .bind(&tu.trip_id)
            .bind(stu.stop_id.as_deref().unwrap_or(""))
            .bind(stu.stop_sequence)
            .bind(stu.arrival_time)
            .bind(stu.arrival_delay_secs)
            .bind(stu.departure_time)
            .bind(stu.departure_delay_secs)
            .bind(stu.skipped as i64)
            .execute(&mut **tx)
            .await?;
        }
    }

    for alert in &data.alerts {
        sqlx::query(
            r#"
            INSERT INTO alerts
                (system_id, source_feed_id, alert_id, cause, effect, header_text, description_text, active_from, active_until)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(system_id, source_feed_id, alert_id) DO UPDATE SET
                cause = excluded.cause,
                effect = excluded.effect,
                header_text = excluded.header_text,
                description_text = excluded.description_text,
                active_from = excluded.active_from,
                active_until = excluded.active_until
            "#,
        )
        .bind(system_id)
        .bind(feed_id)
        .bind(&alert.alert_id)
        .bind(&alert.cause)
        .bind(&alert.effect)
        .bind(&alert.header_text)
        .bind(&alert.description_text)
        .bind(alert.active_from)
        .bind(alert.active_until)
        .execute(&mut **tx)
        .await?;
    }

    debug!(
        system_id,
        feed_id,
        trip_updates = data.trip_updates.len(),
        alerts = data.alerts.len(),
        "Applied GTFS realtime data"
    );
    Ok(())
}

/// Merge station metadata onto existing stops. A row matches the stop with
/// its GTFS ID and that stop's child platforms.
async fn apply_nyct_stations(
    tx: &mut Transaction<'_, Sqlite>,
    system_id: &str,
    rows: &[NyctStationRow],
) -> Result<(), sqlx::Error> {
    let mut matched = 0u64;
    for row in rows {
        let result = sqlx::query(
            r#"
            UPDATE stops SET complex_id = ?, borough = ?, daytime_routes = ?
            WHERE system_id = ? AND (stop_id = ? OR parent_station = ?)
            "#,
        )
        .bind(&row.complex_id)
        .bind(&row.borough)
        .bind(&row.daytime_routes)
        .bind(system_id)
        .bind(&row.gtfs_stop_id)
        .bind(&row.gtfs_stop_id)
        .execute(&mut **tx)
        .await?;
        matched += result.rows_affected();
    }
    debug!(system_id, rows = rows.len(), matched, "Applied NYCT station metadata");
    Ok(())
}

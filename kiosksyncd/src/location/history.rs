use kiosk_core::LocationReport;
use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use super::geofence::{GeofenceEvent, GeofenceTransition};
use crate::sync::queue_store::{QueueError, QueueStore};

pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
pub const DEFAULT_EVENT_LIMIT: usize = 100;

/// Inclusive range of unix milliseconds. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<i64>,
    pub until: Option<i64>,
}

impl TimeRange {
    pub fn between(since: i64, until: i64) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationPoint {
    pub id: i64,
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeofenceEventRecord {
    pub id: i64,
    pub device_id: String,
    pub geofence_id: String,
    pub event_type: String,
    pub place_name: String,
    pub place_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub recorded_at: i64,
    pub dwell_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationStats {
    pub total_points: i64,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub enter_events: i64,
    pub exit_events: i64,
}

/// Local record of fixes and geofence transitions, kept next to the queue
/// so the app can answer history questions while offline.
#[derive(Clone)]
pub struct LocationHistory {
    pool: SqlitePool,
}

impl LocationHistory {
    pub fn new(store: &QueueStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    pub async fn record_location(
        &self,
        fix: &LocationReport,
        recorded_at: i64,
    ) -> Result<i64, QueueError> {
        let result = sqlx::query(
            "INSERT INTO location_history (
                 device_id, latitude, longitude, accuracy, speed, bearing, recorded_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&fix.device_id)
        .bind(fix.latitude)
        .bind(fix.longitude)
        .bind(fix.accuracy.map(f64::from))
        .bind(fix.speed.map(f64::from))
        .bind(fix.bearing.map(f64::from))
        .bind(recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn record_geofence_event(
        &self,
        event: &GeofenceEvent,
        recorded_at: i64,
    ) -> Result<i64, QueueError> {
        let result = sqlx::query(
            "INSERT INTO geofence_events (
                 device_id, geofence_id, event_type, place_name, place_type,
                 latitude, longitude, recorded_at, dwell_secs
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&event.device_id)
        .bind(&event.geofence_id)
        .bind(event.event_type.as_str())
        .bind(&event.place_name)
        .bind(&event.place_type)
        .bind(event.latitude)
        .bind(event.longitude)
        .bind(recorded_at)
        .bind(event.dwell_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Newest fixes first.
    pub async fn locations(
        &self,
        device_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<LocationPoint>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, device_id, latitude, longitude, accuracy, speed, bearing, recorded_at
             FROM location_history
             WHERE device_id = ?1
               AND (?2 IS NULL OR recorded_at >= ?2)
               AND (?3 IS NULL OR recorded_at <= ?3)
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?4",
        )
        .bind(device_id)
        .bind(range.since)
        .bind(range.until)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(point_from_row).collect()
    }

    /// Newest transitions first.
    pub async fn geofence_events(
        &self,
        device_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<GeofenceEventRecord>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, device_id, geofence_id, event_type, place_name, place_type,
                    latitude, longitude, recorded_at, dwell_secs
             FROM geofence_events
             WHERE device_id = ?1
               AND (?2 IS NULL OR recorded_at >= ?2)
               AND (?3 IS NULL OR recorded_at <= ?3)
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?4",
        )
        .bind(device_id)
        .bind(range.since)
        .bind(range.until)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn stats(&self, device_id: &str, range: TimeRange) -> Result<LocationStats, QueueError> {
        let points = sqlx::query(
            "SELECT COUNT(*) AS total, AVG(speed) AS avg_speed, MAX(speed) AS max_speed
             FROM location_history
             WHERE device_id = ?1
               AND (?2 IS NULL OR recorded_at >= ?2)
               AND (?3 IS NULL OR recorded_at <= ?3)",
        )
        .bind(device_id)
        .bind(range.since)
        .bind(range.until)
        .fetch_one(&self.pool)
        .await?;
        let mut stats = LocationStats {
            total_points: points.try_get("total")?,
            avg_speed: points.try_get("avg_speed")?,
            max_speed: points.try_get("max_speed")?,
            ..LocationStats::default()
        };

        let transitions = sqlx::query(
            "SELECT event_type, COUNT(*) AS n
             FROM geofence_events
             WHERE device_id = ?1
               AND (?2 IS NULL OR recorded_at >= ?2)
               AND (?3 IS NULL OR recorded_at <= ?3)
             GROUP BY event_type",
        )
        .bind(device_id)
        .bind(range.since)
        .bind(range.until)
        .fetch_all(&self.pool)
        .await?;
        for row in transitions {
            let event_type: String = row.try_get("event_type")?;
            let n: i64 = row.try_get("n")?;
            if event_type == GeofenceTransition::Enter.as_str() {
                stats.enter_events = n;
            } else if event_type == GeofenceTransition::Exit.as_str() {
                stats.exit_events = n;
            }
        }
        Ok(stats)
    }

    /// Deletes fixes and transitions recorded before `cutoff`.
    pub async fn cleanup_older_than(&self, cutoff: i64) -> Result<u64, QueueError> {
        let mut tx = self.pool.begin().await?;
        let points = sqlx::query("DELETE FROM location_history WHERE recorded_at < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let events = sqlx::query("DELETE FROM geofence_events WHERE recorded_at < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(points.rows_affected() + events.rows_affected())
    }
}

fn point_from_row(row: &SqliteRow) -> Result<LocationPoint, QueueError> {
    Ok(LocationPoint {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        accuracy: row.try_get("accuracy")?,
        speed: row.try_get("speed")?,
        bearing: row.try_get("bearing")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<GeofenceEventRecord, QueueError> {
    Ok(GeofenceEventRecord {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        geofence_id: row.try_get("geofence_id")?,
        event_type: row.try_get("event_type")?,
        place_name: row.try_get("place_name")?,
        place_type: row.try_get("place_type")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        recorded_at: row.try_get("recorded_at")?,
        dwell_secs: row.try_get("dwell_secs")?,
    })
}

//! SQLite event log -- append-only tables for cleaned readings and alert
//! transitions.

pub mod schema;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::alert::AlertTransition;
use crate::pipeline::CleanedReading;
use crate::sink::EventSink;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).with_context(|| format!("opening {}", path))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn save_cleaned_reading(pool: &Pool, c: &CleanedReading) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO cleaned_readings (sensor_id, sensor_type, sequence_no, value, reading_ts,
            statistical_score, model_score, combined_score, classification, model_version, window_len)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            c.reading.sensor_id,
            c.reading.sensor_type.as_str(),
            c.reading.sequence_no as i64,
            c.reading.value,
            ts(c.reading.timestamp),
            c.score.statistical_score,
            c.score.model_score,
            c.score.combined_score,
            c.score.classification.to_string(),
            c.score.model_version.map(|v| v as i64),
            c.window_len as i64,
        ],
    )?;
    Ok(())
}

pub fn save_alert_transition(pool: &Pool, t: &AlertTransition) -> Result<()> {
    let conn = pool.get()?;
    let a = &t.alert;
    conn.execute(
        "INSERT INTO alert_events (alert_id, transition, sensor_id, sensor_type, severity, state,
            occurrence_count, first_seen_ts, last_seen_ts, acknowledged_at, resolved_at, transition_ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            a.alert_id.to_string(),
            t.kind.as_str(),
            a.sensor_id,
            a.sensor_type.as_str(),
            a.severity.as_str(),
            a.state.as_str(),
            a.occurrence_count as i64,
            ts(a.first_seen_ts),
            ts(a.last_seen_ts),
            a.acknowledged_at.map(ts),
            a.resolved_at.map(ts),
            ts(t.at),
        ],
    )?;
    Ok(())
}

/// Appends every event to SQLite. Writes run on the blocking pool.
pub struct SqliteSink {
    pool: Pool,
}

impl SqliteSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn cleaned(&mut self, reading: &CleanedReading) -> Result<()> {
        let pool = self.pool.clone();
        let reading = reading.clone();
        tokio::task::spawn_blocking(move || save_cleaned_reading(&pool, &reading)).await?
    }

    async fn alert(&mut self, transition: &AlertTransition) -> Result<()> {
        let pool = self.pool.clone();
        let transition = transition.clone();
        tokio::task::spawn_blocking(move || save_alert_transition(&pool, &transition)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertEvent, AlertState, Severity, TransitionKind};
    use crate::detect::{AnomalyScore, Classification, FeatureVector};
    use crate::ingest::{Reading, SensorType};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    struct AlertEventRow {
        alert_id: String,
        transition: String,
        sensor_id: String,
        severity: String,
        state: String,
        occurrence_count: u64,
    }

    /// Newest first.
    fn list_alert_events(pool: &Pool, limit: usize) -> Result<Vec<AlertEventRow>> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT alert_id, transition, sensor_id, severity, state, occurrence_count
             FROM alert_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(AlertEventRow {
                alert_id: row.get(0)?,
                transition: row.get(1)?,
                sensor_id: row.get(2)?,
                severity: row.get(3)?,
                state: row.get(4)?,
                occurrence_count: row.get::<_, i64>(5)? as u64,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    fn count_cleaned_readings(pool: &Pool, sensor_id: &str) -> Result<u64> {
        let conn = pool.get()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cleaned_readings WHERE sensor_id = ?1",
            [sensor_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    fn pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_dir, pool) = pool();
        let conn = pool.get().unwrap();
        schema::migrate(&conn).unwrap();
        schema::migrate(&conn).unwrap();
    }

    #[test]
    fn test_cleaned_reading_round_trip() {
        let (_dir, pool) = pool();
        let now = Utc::now();
        let c = CleanedReading {
            reading: Reading::new("pres-1", SensorType::Pressure, 1012.5, now, 4),
            score: AnomalyScore {
                sensor_id: "pres-1".into(),
                timestamp: now,
                statistical_score: 0.4,
                model_score: None,
                combined_score: 0.4,
                classification: Classification::Normal,
                model_version: None,
                features: FeatureVector([1012.5, 0.1, 0.0]),
            },
            window_len: 4,
        };
        save_cleaned_reading(&pool, &c).unwrap();
        save_cleaned_reading(&pool, &c).unwrap();
        assert_eq!(count_cleaned_readings(&pool, "pres-1").unwrap(), 2);
        assert_eq!(count_cleaned_readings(&pool, "other").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_sink_appends_transitions() {
        let (_dir, pool) = pool();
        let mut sink = SqliteSink::new(pool.clone());
        let now = Utc::now();
        let mut alert = AlertEvent {
            alert_id: Uuid::new_v4(),
            sensor_id: "temp-1".into(),
            sensor_type: SensorType::Temperature,
            first_seen_ts: now,
            last_seen_ts: now,
            severity: Severity::Critical,
            occurrence_count: 1,
            state: AlertState::Open,
            acknowledged_at: None,
            resolved_at: None,
        };
        sink.alert(&AlertTransition { kind: TransitionKind::Opened, at: now, alert: alert.clone() })
            .await
            .unwrap();
        alert.state = AlertState::Resolved;
        alert.resolved_at = Some(now);
        sink.alert(&AlertTransition { kind: TransitionKind::Resolved, at: now, alert })
            .await
            .unwrap();

        let rows = list_alert_events(&pool, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].transition, "resolved");
        assert_eq!(rows[1].transition, "opened");
        assert_eq!(rows[1].severity, "critical");
        assert_eq!(rows[0].alert_id, rows[1].alert_id);
        assert_eq!(rows[0].state, "resolved");
        assert_eq!(rows[1].sensor_id, "temp-1");
        assert_eq!(rows[1].occurrence_count, 1);
    }
}

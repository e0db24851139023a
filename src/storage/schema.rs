//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS cleaned_readings (
            id INTEGER PRIMARY KEY,
            sensor_id TEXT NOT NULL,
            sensor_type TEXT NOT NULL,
            sequence_no INTEGER NOT NULL,
            value REAL NOT NULL,
            reading_ts TEXT NOT NULL,
            statistical_score REAL NOT NULL,
            model_score REAL,
            combined_score REAL NOT NULL,
            classification TEXT NOT NULL,
            model_version INTEGER,
            window_len INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS alert_events (
            id INTEGER PRIMARY KEY,
            alert_id TEXT NOT NULL,
            transition TEXT NOT NULL,
            sensor_id TEXT NOT NULL,
            sensor_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            state TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL,
            first_seen_ts TEXT NOT NULL,
            last_seen_ts TEXT NOT NULL,
            acknowledged_at TEXT,
            resolved_at TEXT,
            transition_ts TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_readings_sensor ON cleaned_readings(sensor_id, sequence_no);
        CREATE INDEX IF NOT EXISTS idx_alert_events_alert ON alert_events(alert_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

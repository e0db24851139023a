//! Newline-delimited JSON ingest.
//!
//! Each non-blank line is one reading object:
//!
//! ```json
//! {"sensor_id":"temp-1","sensor_type":"temperature","value":22.1,
//!  "timestamp":"2024-05-01T12:00:00Z","sequence_no":42}
//! ```
//!
//! A missing or `null` value decodes to NaN so the validator can reject it as
//! malformed; anything that cannot be decoded into a reading at all is an
//! [`IngestError`].

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use super::{Reading, SensorType};
use crate::pipeline::{Pipeline, PipelineError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid reading: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("sensor_id must not be empty")]
    EmptySensorId,
}

#[derive(Debug, Deserialize)]
struct WireReading {
    sensor_id: String,
    sensor_type: SensorType,
    #[serde(default)]
    value: Option<f64>,
    timestamp: DateTime<Utc>,
    sequence_no: u64,
}

/// Decode a single NDJSON line into a [`Reading`].
pub fn decode_line(line: &str) -> Result<Reading, IngestError> {
    from_wire(serde_json::from_str(line.trim())?)
}

/// Decode an already-parsed JSON object, as posted to the HTTP API.
pub fn decode_value(value: serde_json::Value) -> Result<Reading, IngestError> {
    from_wire(serde_json::from_value(value)?)
}

fn from_wire(wire: WireReading) -> Result<Reading, IngestError> {
    if wire.sensor_id.trim().is_empty() {
        return Err(IngestError::EmptySensorId);
    }
    Ok(Reading {
        sensor_id: wire.sensor_id,
        sensor_type: wire.sensor_type,
        value: wire.value.unwrap_or(f64::NAN),
        timestamp: wire.timestamp,
        sequence_no: wire.sequence_no,
    })
}

/// Counters for one pass over an input stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FeedStats {
    pub lines: u64,
    pub decoded: u64,
    pub undecodable: u64,
    pub event_sweeps: u64,
    /// Readings dropped because their sensor would exceed `stream.max_sensors`.
    pub over_limit: u64,
}

/// Read NDJSON readings from `reader` until EOF and hand each to the pipeline.
///
/// Undecodable lines are counted as malformed data-quality rejections and
/// skipped; only a closed pipeline stops the feed early.
///
/// With `event_sweep`, quiet alerts are swept on the recording's own clock.
/// Once input timestamps move that far past the previous check, the workers
/// are drained and every sensor is swept at the latest *accepted* timestamp,
/// so a rejected far-future reading cannot resolve anything early.
pub async fn feed<R>(reader: R, pipeline: &Pipeline, event_sweep: Option<Duration>) -> Result<FeedStats, PipelineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = FeedStats::default();
    let mut lines = reader.lines();
    let mut next_check: Option<DateTime<Utc>> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Input stream read failed, stopping feed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        match decode_line(&line) {
            Ok(reading) => {
                stats.decoded += 1;
                let ts = reading.timestamp;
                match pipeline.ingest(reading).await {
                    Ok(()) => {}
                    Err(PipelineError::SensorLimit(limit)) => {
                        stats.over_limit += 1;
                        debug!(line = stats.lines, limit, "Dropping reading from untracked sensor");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                if let Some(every) = event_sweep {
                    match next_check {
                        None => next_check = ts.checked_add_signed(every),
                        Some(due) if ts >= due => {
                            pipeline.drain().await;
                            let latest = pipeline.latest_event_time();
                            if let Some(latest) = latest {
                                stats.event_sweeps += 1;
                                pipeline.sweep_alerts(latest).await;
                            }
                            next_check = latest.unwrap_or(ts).checked_add_signed(every);
                        }
                        Some(_) => {}
                    }
                }
            }
            Err(e) => {
                stats.undecodable += 1;
                pipeline.record_undecodable();
                debug!(line = stats.lines, error = %e, "Dropping undecodable input line");
            }
        }
    }

    Ok(stats)
}

//! Structural, range and ordering checks applied before a reading is allowed
//! to touch any per-sensor state.
//!
//! Validation is pure: it classifies a reading against the last accepted
//! reading for the same sensor and returns. Counting rejections for the
//! data-quality view is the caller's job ([`QualityCounters`]).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::{PipelineConfig, SensorsConfig};
use crate::ingest::{Reading, SensorType};

/// Why a reading was dropped.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("{sensor_type} value {value} outside valid range [{min}, {max}]")]
    OutOfRange {
        sensor_type: SensorType,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("malformed reading: {detail}")]
    Malformed { detail: String },
    #[error("stale reading at {timestamp}, latest accepted is {last_timestamp}")]
    Stale {
        timestamp: DateTime<Utc>,
        last_timestamp: DateTime<Utc>,
    },
    #[error("duplicate sequence {sequence_no} (last accepted {last_sequence_no})")]
    DuplicateSequence { sequence_no: u64, last_sequence_no: u64 },
}

impl ValidationError {
    pub fn reason(&self) -> RejectReason {
        match self {
            ValidationError::OutOfRange { .. } => RejectReason::OutOfRange,
            ValidationError::Malformed { .. } => RejectReason::Malformed,
            ValidationError::Stale { .. } => RejectReason::Stale,
            ValidationError::DuplicateSequence { .. } => RejectReason::DuplicateSequence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    OutOfRange,
    Malformed,
    Stale,
    DuplicateSequence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Accepted,
    Rejected(ValidationError),
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationResult::Accepted)
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            ValidationResult::Accepted => None,
            ValidationResult::Rejected(e) => Some(e.reason()),
        }
    }
}

/// Position of the last accepted reading for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorCursor {
    pub sensor_type: SensorType,
    pub last_sequence_no: u64,
    pub last_timestamp: DateTime<Utc>,
}

pub struct Validator {
    sensors: SensorsConfig,
    staleness_tolerance: chrono::Duration,
}

impl Validator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            sensors: config.sensors.clone(),
            staleness_tolerance: config.validation.staleness_tolerance(),
        }
    }

    pub fn validate(&self, reading: &Reading, prior: Option<SensorCursor>) -> ValidationResult {
        match self.check(reading, prior) {
            Ok(()) => ValidationResult::Accepted,
            Err(e) => ValidationResult::Rejected(e),
        }
    }

    fn check(&self, reading: &Reading, prior: Option<SensorCursor>) -> Result<(), ValidationError> {
        // Replay protection comes first so it holds regardless of value.
        if let Some(cursor) = prior {
            if reading.sequence_no <= cursor.last_sequence_no {
                return Err(ValidationError::DuplicateSequence {
                    sequence_no: reading.sequence_no,
                    last_sequence_no: cursor.last_sequence_no,
                });
            }
        }

        if let Some(cursor) = prior {
            if reading.sensor_type != cursor.sensor_type {
                return Err(ValidationError::Malformed {
                    detail: format!(
                        "sensor type {} does not match established type {}",
                        reading.sensor_type, cursor.sensor_type
                    ),
                });
            }
        }

        if !reading.value.is_finite() {
            return Err(ValidationError::Malformed {
                detail: format!("non-finite value {}", reading.value),
            });
        }

        let profile = self.sensors.profile(reading.sensor_type);
        if reading.value < profile.min || reading.value > profile.max {
            return Err(ValidationError::OutOfRange {
                sensor_type: reading.sensor_type,
                value: reading.value,
                min: profile.min,
                max: profile.max,
            });
        }

        let (lo, hi) = reading.sensor_type.physical_domain();
        if reading.value < lo || reading.value > hi {
            return Err(ValidationError::Malformed {
                detail: format!(
                    "{} value {} is physically impossible",
                    reading.sensor_type, reading.value
                ),
            });
        }

        if let Some(cursor) = prior {
            let horizon = cursor.last_timestamp.checked_sub_signed(self.staleness_tolerance);
            if horizon.is_some_and(|h| reading.timestamp < h) {
                return Err(ValidationError::Stale {
                    timestamp: reading.timestamp,
                    last_timestamp: cursor.last_timestamp,
                });
            }
        }

        Ok(())
    }
}

/// Lock-free data-quality counters shared by all sensor workers.
#[derive(Debug, Default)]
pub struct QualityCounters {
    accepted: AtomicU64,
    out_of_range: AtomicU64,
    malformed: AtomicU64,
    stale: AtomicU64,
    duplicate_sequence: AtomicU64,
}

impl QualityCounters {
    pub fn record(&self, result: &ValidationResult) {
        let counter = match result.reason() {
            None => &self.accepted,
            Some(RejectReason::OutOfRange) => &self.out_of_range,
            Some(RejectReason::Malformed) => &self.malformed,
            Some(RejectReason::Stale) => &self.stale,
            Some(RejectReason::DuplicateSequence) => &self.duplicate_sequence,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Input that never decoded into a reading counts as malformed.
    pub fn record_undecodable(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QualitySnapshot {
        QualitySnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            duplicate_sequence: self.duplicate_sequence.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualitySnapshot {
    pub accepted: u64,
    pub out_of_range: u64,
    pub malformed: u64,
    pub stale: u64,
    pub duplicate_sequence: u64,
}

impl QualitySnapshot {
    pub fn rejected(&self) -> u64 {
        self.out_of_range + self.malformed + self.stale + self.duplicate_sequence
    }
}

//! Sensor readings -- the atomic unit flowing through the pipeline -- and
//! decoding of the NDJSON ingest format.

pub mod ndjson;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of environmental measurement a sensor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    AirQuality,
    Pressure,
}

impl SensorType {
    pub const ALL: [SensorType; 4] = [
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::AirQuality,
        SensorType::Pressure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::AirQuality => "air_quality",
            SensorType::Pressure => "pressure",
        }
    }

    /// Values that can physically exist for this kind of measurement,
    /// regardless of what an operator considers plausible.
    pub fn physical_domain(&self) -> (f64, f64) {
        match self {
            SensorType::Temperature => (-273.15, f64::INFINITY),
            SensorType::Humidity => (0.0, 100.0),
            SensorType::AirQuality => (0.0, f64::INFINITY),
            SensorType::Pressure => (f64::MIN_POSITIVE, f64::INFINITY),
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(SensorType::Temperature),
            "humidity" => Ok(SensorType::Humidity),
            "air_quality" => Ok(SensorType::AirQuality),
            "pressure" => Ok(SensorType::Pressure),
            other => Err(format!("unknown sensor type '{}'", other)),
        }
    }
}

/// One timestamped sensor measurement. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub sequence_no: u64,
}

impl Reading {
    pub fn new(
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        value: f64,
        timestamp: DateTime<Utc>,
        sequence_no: u64,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type,
            value,
            timestamp,
            sequence_no,
        }
    }
}

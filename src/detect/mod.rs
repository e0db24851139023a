//! Anomaly scoring: a fast statistical check blended with a periodically
//! retrained isolation forest per model group.

pub mod features;
pub mod forest;
pub mod registry;
pub mod score;
pub mod trainer;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::ModelScope;
use crate::ingest::{Reading, SensorType};

pub use self::features::FeatureVector;
pub use self::score::Detector;

/// Why a model could not be (re)fitted. The previous model stays in place.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelFitError {
    #[error("insufficient training samples: need {needed}, have {have}")]
    InsufficientSamples { needed: usize, have: usize },
    #[error("training snapshot has no variance in any feature")]
    DegenerateVariance,
    #[error("model fit cancelled")]
    Cancelled,
    #[error("model fit exceeded {0:?}")]
    TimedOut(Duration),
    #[error("model fit task failed: {0}")]
    Task(String),
}

/// Outcome of scoring one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Normal,
    Warning,
    Critical,
}

impl Classification {
    pub fn is_anomalous(&self) -> bool {
        !matches!(self, Classification::Normal)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Classification::Normal => "normal",
            Classification::Warning => "warning",
            Classification::Critical => "critical",
        })
    }
}

/// Derived score for one accepted reading. Recomputable from the stream
/// state, the model and the reading, so never stored authoritatively.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyScore {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub statistical_score: f64,
    pub model_score: Option<f64>,
    pub combined_score: f64,
    pub classification: Classification,
    pub model_version: Option<u64>,
    pub features: FeatureVector,
}

/// Set of sensors sharing one model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelGroup {
    Type(SensorType),
    Sensor(String),
}

const SENSOR_GROUP_PREFIX: &str = "sensor:";

impl ModelGroup {
    pub fn for_reading(scope: ModelScope, reading: &Reading) -> Self {
        match scope {
            ModelScope::SensorType => ModelGroup::Type(reading.sensor_type),
            ModelScope::SensorId => ModelGroup::Sensor(reading.sensor_id.clone()),
        }
    }
}

impl fmt::Display for ModelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelGroup::Type(t) => write!(f, "{}", t),
            ModelGroup::Sensor(id) => write!(f, "{}{}", SENSOR_GROUP_PREFIX, id),
        }
    }
}

impl FromStr for ModelGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(SENSOR_GROUP_PREFIX) {
            Some("") => Err("empty sensor id in model group".to_string()),
            Some(id) => Ok(ModelGroup::Sensor(id.to_string())),
            None => s.parse().map(ModelGroup::Type),
        }
    }
}

impl Serialize for ModelGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_group_parse_and_display() {
        let g: ModelGroup = "humidity".parse().unwrap();
        assert_eq!(g, ModelGroup::Type(SensorType::Humidity));
        let g: ModelGroup = "sensor:temp-1".parse().unwrap();
        assert_eq!(g, ModelGroup::Sensor("temp-1".into()));
        assert_eq!(g.to_string(), "sensor:temp-1");
        assert!("sensor:".parse::<ModelGroup>().is_err());
        assert!("wind".parse::<ModelGroup>().is_err());
    }

    #[test]
    fn test_classification_ordering() {
        assert!(Classification::Critical > Classification::Warning);
        assert!(Classification::Warning > Classification::Normal);
        assert!(!Classification::Normal.is_anomalous());
    }
}

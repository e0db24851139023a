use std::collections::HashMap;

use crate::config::{PipelineConfig, SensorProfile};
use crate::ingest::{Reading, SensorType};
use crate::stream::StreamState;

use super::features::FeatureVector;
use super::registry::TrainedModel;
use super::{AnomalyScore, Classification};

/// Standard deviations below this are treated as a flat baseline.
pub const STD_EPSILON: f64 = 1e-9;

/// Scores accepted readings against their sensor's baseline and, when one is
/// trained, the group model.
#[derive(Debug, Clone)]
pub struct Detector {
    profiles: HashMap<SensorType, SensorProfile>,
    min_history: usize,
    blend_weight: f64,
    slope_window: usize,
}

impl Detector {
    pub fn new(config: &PipelineConfig) -> Self {
        let profiles = SensorType::ALL
            .iter()
            .map(|t| (*t, config.sensors.profile(*t)))
            .collect();
        Self {
            profiles,
            min_history: config.stream.min_history,
            blend_weight: config.model.blend_weight,
            slope_window: config.stream.slope_window,
        }
    }

    fn profile(&self, sensor_type: SensorType) -> SensorProfile {
        self.profiles
            .get(&sensor_type)
            .copied()
            .unwrap_or_else(|| SensorProfile::default_for(sensor_type))
    }

    /// `state` must already include `reading`; its baseline describes the
    /// window as it was before the reading arrived.
    pub fn score(
        &self,
        state: &StreamState,
        model: Option<&TrainedModel>,
        reading: &Reading,
    ) -> AnomalyScore {
        let profile = self.profile(reading.sensor_type);
        let baseline = state.baseline();
        let enough_history = baseline.count >= self.min_history;

        let statistical_score = if !enough_history || baseline.std_dev < STD_EPSILON {
            0.0
        } else {
            (reading.value - baseline.mean).abs() / baseline.std_dev
        };

        let features = FeatureVector::extract(state, reading.value, self.slope_window);
        let model = model.filter(|_| enough_history);
        let model_score = model.map(|m| m.forest.score(&features));

        let combined_score = match model_score {
            Some(ms) => {
                let component = ((ms - 0.5) * 2.0).clamp(0.0, 1.0) * profile.critical_threshold;
                (1.0 - self.blend_weight) * statistical_score + self.blend_weight * component
            }
            None => statistical_score,
        };

        AnomalyScore {
            sensor_id: reading.sensor_id.clone(),
            timestamp: reading.timestamp,
            statistical_score,
            model_score,
            combined_score,
            classification: classify(combined_score, &profile),
            model_version: model.map(|m| m.version),
            features,
        }
    }
}

pub fn classify(score: f64, profile: &SensorProfile) -> Classification {
    if score >= profile.critical_threshold {
        Classification::Critical
    } else if score >= profile.warning_threshold {
        Classification::Warning
    } else {
        Classification::Normal
    }
}

//! Feature vector fed to the unsupervised model.

use serde::Serialize;

use crate::stream::StreamState;

pub const FEATURE_DIM: usize = 3;

/// `[value, value - window mean, short-term slope]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector(pub [f64; FEATURE_DIM]);

impl FeatureVector {
    /// Build features for `value`, which must already be the newest entry in
    /// the state's window.
    pub fn extract(state: &StreamState, value: f64, slope_window: usize) -> Self {
        let window = state.window();
        let deviation = window.mean().map(|m| value - m).unwrap_or(0.0);
        let slope = window.slope(slope_window).unwrap_or(0.0);
        FeatureVector([value, deviation, slope])
    }

    pub fn get(&self, dim: usize) -> f64 {
        self.0[dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Reading, SensorType};
    use chrono::Utc;

    #[test]
    fn test_single_sample_has_zero_deviation_and_slope() {
        let r = Reading::new("a", SensorType::Pressure, 1013.0, Utc::now(), 1);
        let state = StreamState::new(&r, 10);
        assert_eq!(FeatureVector::extract(&state, 1013.0, 5).0, [1013.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rising_values_have_positive_slope() {
        let now = Utc::now();
        let mut state = StreamState::new(&Reading::new("a", SensorType::Temperature, 20.0, now, 1), 10);
        for i in 2..=5 {
            state.push(&Reading::new("a", SensorType::Temperature, 20.0 + i as f64, now, i));
        }
        let f = FeatureVector::extract(&state, 25.0, 5);
        assert!(f.get(1) > 0.0);
        assert!(f.get(2) > 0.0);
    }
}

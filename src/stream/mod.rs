//! Per-sensor rolling window and baseline statistics.
//!
//! Mean and variance are maintained incrementally (Welford) as values enter
//! and leave the window, so an update never rescans history. Values leaving
//! the window are removed with the inverse Welford step; a full resync runs
//! once per `capacity` evictions to keep floating-point drift bounded.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ingest::{Reading, SensorType};
use crate::validate::SensorCursor;

/// Bounded, oldest-evicted window of recent accepted values.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    mean: f64,
    m2: f64,
    evictions_since_resync: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            mean: 0.0,
            m2: 0.0,
            evictions_since_resync: 0,
        }
    }

    /// Append a value, returning the evicted oldest value if the window was full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = if self.values.len() == self.capacity {
            let old = self.values.pop_front();
            if let Some(old) = old {
                self.remove_stat(old);
            }
            old
        } else {
            None
        };

        self.values.push_back(value);
        self.add_stat(value);

        if evicted.is_some() {
            self.evictions_since_resync += 1;
            if self.evictions_since_resync >= self.capacity {
                self.resync();
            }
        }
        evicted
    }

    fn add_stat(&mut self, x: f64) {
        let n = self.values.len() as f64;
        let delta = x - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (x - self.mean);
    }

    /// Inverse Welford step; `self.values` already excludes `x`.
    fn remove_stat(&mut self, x: f64) {
        let n = self.values.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let old_mean = self.mean;
        self.mean = (old_mean * (n + 1) as f64 - x) / n as f64;
        self.m2 -= (x - old_mean) * (x - self.mean);
        if self.m2 < 0.0 {
            self.m2 = 0.0;
        }
    }

    fn resync(&mut self) {
        let n = self.values.len() as f64;
        self.mean = self.values.iter().sum::<f64>() / n;
        self.m2 = self.values.iter().map(|v| (v - self.mean).powi(2)).sum();
        self.evictions_since_resync = 0;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Undefined until at least two samples exist.
    pub fn mean(&self) -> Option<f64> {
        (self.values.len() >= 2).then_some(self.mean)
    }

    /// Sample variance (n - 1). Undefined until at least two samples exist.
    pub fn variance(&self) -> Option<f64> {
        let n = self.values.len();
        (n >= 2).then(|| self.m2 / (n - 1) as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    /// Least-squares slope (units per sample) over the last `k` values.
    pub fn slope(&self, k: usize) -> Option<f64> {
        let k = k.min(self.values.len());
        if k < 2 {
            return None;
        }
        let start = self.values.len() - k;
        let n = k as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = self.values.range(start..).sum::<f64>() / n;

        let (mut num, mut den) = (0.0, 0.0);
        for (i, y) in self.values.range(start..).enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        if den.abs() < 1e-12 {
            return None;
        }
        Some(num / den)
    }

    pub fn baseline(&self) -> Baseline {
        Baseline {
            count: self.values.len(),
            mean: self.mean().unwrap_or(0.0),
            std_dev: self.std_dev().unwrap_or(0.0),
        }
    }
}

/// Window statistics as they stood immediately before the latest reading
/// was appended. Mean and stddev are 0 while `count < 2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Baseline {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
}

/// Rolling state for one sensor, owned exclusively by that sensor's worker.
#[derive(Debug, Clone)]
pub struct StreamState {
    sensor_id: String,
    sensor_type: SensorType,
    window: RollingWindow,
    baseline: Baseline,
    last_sequence_no: u64,
    last_timestamp: DateTime<Utc>,
    model_version: Option<u64>,
    accepted: u64,
}

impl StreamState {
    /// Create the state for a sensor from its first accepted reading.
    pub fn new(first: &Reading, capacity: usize) -> Self {
        let mut state = Self {
            sensor_id: first.sensor_id.clone(),
            sensor_type: first.sensor_type,
            window: RollingWindow::new(capacity),
            baseline: Baseline::default(),
            last_sequence_no: first.sequence_no,
            last_timestamp: first.timestamp,
            model_version: None,
            accepted: 0,
        };
        state.push(first);
        state
    }

    /// Apply an accepted reading, producing the next state.
    pub fn update(mut self, reading: &Reading) -> Self {
        self.push(reading);
        self
    }

    /// In-place form of [`StreamState::update`].
    pub fn push(&mut self, reading: &Reading) {
        debug_assert_eq!(reading.sensor_id, self.sensor_id);
        self.baseline = self.window.baseline();
        self.window.push(reading.value);
        self.last_sequence_no = reading.sequence_no;
        self.last_timestamp = self.last_timestamp.max(reading.timestamp);
        self.accepted += 1;
    }

    pub fn cursor(&self) -> SensorCursor {
        SensorCursor {
            sensor_type: self.sensor_type,
            last_sequence_no: self.last_sequence_no,
            last_timestamp: self.last_timestamp,
        }
    }

    pub fn set_model_version(&mut self, version: Option<u64>) {
        self.model_version = version;
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    pub fn last_timestamp(&self) -> DateTime<Utc> {
        self.last_timestamp
    }

    pub fn model_version(&self) -> Option<u64> {
        self.model_version
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn reading(seq: u64, value: f64) -> Reading {
        Reading::new(
            "temp-1",
            SensorType::Temperature,
            value,
            Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
            seq,
        )
    }

    fn direct_stats(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var)
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut rng = StdRng::seed_from_u64(7);
        for capacity in [1, 2, 5, 64] {
            let mut w = RollingWindow::new(capacity);
            for _ in 0..500 {
                w.push(rng.gen_range(-50.0..50.0));
                assert!(w.len() <= capacity);
            }
            assert_eq!(w.len(), capacity);
        }
    }

    #[test]
    fn test_welford_matches_direct_recomputation() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut w = RollingWindow::new(50);
        for i in 0..2_000 {
            // Large offset stresses cancellation in the inverse step.
            w.push(1_000.0 + rng.gen_range(-5.0..5.0));
            if i >= 1 {
                let values: Vec<f64> = w.values().collect();
                let (mean, var) = direct_stats(&values);
                assert!((w.mean().unwrap() - mean).abs() < 1e-8, "mean drift at {}", i);
                assert!((w.variance().unwrap() - var).abs() < 1e-6, "variance drift at {}", i);
            }
        }
    }

    #[test]
    fn test_statistics_undefined_below_two_samples() {
        let mut w = RollingWindow::new(10);
        assert_eq!(w.mean(), None);
        w.push(3.0);
        assert_eq!(w.mean(), None);
        assert_eq!(w.variance(), None);
        w.push(5.0);
        assert_eq!(w.mean(), Some(4.0));
        assert_eq!(w.variance(), Some(2.0));
    }

    #[test]
    fn test_capacity_one_window_tracks_latest() {
        let mut w = RollingWindow::new(1);
        assert_eq!(w.push(1.0), None);
        assert_eq!(w.push(2.0), Some(1.0));
        assert_eq!(w.latest(), Some(2.0));
        assert_eq!(w.mean(), None);
    }

    #[test]
    fn test_slope_of_linear_ramp() {
        let mut w = RollingWindow::new(20);
        for i in 0..20 {
            w.push(10.0 + 0.5 * i as f64);
        }
        assert!((w.slope(5).unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(w.slope(1), None);
    }

    #[test]
    fn test_baseline_excludes_latest_reading() {
        let mut state = StreamState::new(&reading(1, 20.0), 10);
        state = state.update(&reading(2, 22.0));
        state = state.update(&reading(3, 90.0));
        let b = state.baseline();
        assert_eq!(b.count, 2);
        assert_eq!(b.mean, 21.0);
        assert_eq!(state.window().len(), 3);
        assert_eq!(state.cursor().last_sequence_no, 3);
    }

    #[test]
    fn test_update_matches_push() {
        let a = StreamState::new(&reading(1, 1.0), 4).update(&reading(2, 2.0));
        let mut b = StreamState::new(&reading(1, 1.0), 4);
        b.push(&reading(2, 2.0));
        assert_eq!(a.window().mean(), b.window().mean());
        assert_eq!(a.accepted(), 2);
        assert_eq!(b.accepted(), 2);
    }
}

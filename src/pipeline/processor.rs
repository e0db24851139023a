//! Synchronous per-sensor core: validate, update, score, alert.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::alert::{AlertError, AlertPolicy, AlertTracker, AlertTransition};
use crate::config::{ModelScope, PipelineConfig};
use crate::detect::registry::{ModelRegistry, SampleBuffer};
use crate::detect::trainer::{RetrainRequest, RetrainTrigger};
use crate::detect::{AnomalyScore, Classification, Detector, ModelGroup};
use crate::ingest::{Reading, SensorType};
use crate::stream::StreamState;
use crate::validate::{QualityCounters, ValidationResult, Validator};

/// An accepted reading annotated with its score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanedReading {
    pub reading: Reading,
    pub score: AnomalyScore,
    pub window_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub validation: ValidationResult,
    pub cleaned: Option<CleanedReading>,
    /// At most a resolution of a quiet alert followed by the transition
    /// caused by this reading.
    pub transitions: Vec<AlertTransition>,
}

/// Everything a sensor processor needs that is shared across sensors.
pub struct SensorContext {
    pub validator: Validator,
    pub detector: Detector,
    pub registry: Arc<ModelRegistry>,
    pub quality: Arc<QualityCounters>,
    pub scope: ModelScope,
    pub window_capacity: usize,
    pub min_history: usize,
    pub policy: AlertPolicy,
    pub retrain_every: Option<u64>,
    pub retrain_tx: mpsc::Sender<RetrainRequest>,
    latest_accepted_ms: AtomicI64,
}

impl SensorContext {
    pub fn new(
        config: &PipelineConfig,
        registry: Arc<ModelRegistry>,
        quality: Arc<QualityCounters>,
        retrain_tx: mpsc::Sender<RetrainRequest>,
    ) -> Self {
        Self {
            validator: Validator::new(config),
            detector: Detector::new(config),
            registry,
            quality,
            scope: config.model.scope,
            window_capacity: config.stream.window_capacity,
            min_history: config.stream.min_history,
            policy: AlertPolicy::from(&config.alerts),
            retrain_every: config.model.retrain_every_samples.filter(|n| *n > 0),
            retrain_tx,
            latest_accepted_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Latest timestamp of any accepted reading, across all sensors.
    pub fn latest_accepted(&self) -> Option<DateTime<Utc>> {
        match self.latest_accepted_ms.load(Ordering::Relaxed) {
            i64::MIN => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// Owns one sensor's stream state and alert tracker. Not thread-safe by
/// design of use: exactly one worker drives it.
pub struct SensorProcessor {
    ctx: Arc<SensorContext>,
    state: Option<StreamState>,
    alerts: AlertTracker,
    samples: Option<SampleBuffer>,
}

impl SensorProcessor {
    pub fn new(ctx: Arc<SensorContext>, sensor_id: &str, sensor_type: SensorType) -> Self {
        let alerts = AlertTracker::new(sensor_id, sensor_type, ctx.policy);
        Self {
            ctx,
            state: None,
            alerts,
            samples: None,
        }
    }

    pub fn state(&self) -> Option<&StreamState> {
        self.state.as_ref()
    }

    pub fn alerts(&self) -> &AlertTracker {
        &self.alerts
    }

    pub fn process(&mut self, reading: Reading) -> ProcessOutcome {
        let ctx = self.ctx.clone();
        let validation = ctx
            .validator
            .validate(&reading, self.state.as_ref().map(StreamState::cursor));
        ctx.quality.record(&validation);

        if let ValidationResult::Rejected(err) = &validation {
            debug!(sensor = %reading.sensor_id, seq = reading.sequence_no, reason = ?err.reason(), "Reading rejected: {}", err);
            return ProcessOutcome {
                validation,
                cleaned: None,
                transitions: Vec::new(),
            };
        }
        ctx.latest_accepted_ms
            .fetch_max(reading.timestamp.timestamp_millis(), Ordering::Relaxed);

        let fresh = self.state.is_none();
        if fresh {
            // The first accepted reading fixes the sensor's type.
            self.alerts = AlertTracker::new(&reading.sensor_id, reading.sensor_type, ctx.policy);
        }
        let state = self
            .state
            .get_or_insert_with(|| StreamState::new(&reading, ctx.window_capacity));
        if !fresh {
            state.push(&reading);
        }

        let group = ModelGroup::for_reading(ctx.scope, &reading);
        let model = ctx.registry.current(&group);
        let score = ctx.detector.score(state, model.as_deref(), &reading);
        state.set_model_version(score.model_version);
        let window_len = state.window().len();

        if score.classification != Classification::Critical
            && state.baseline().count >= ctx.min_history
        {
            // Type and group are fixed by the first accepted reading.
            let since = self
                .samples
                .get_or_insert_with(|| ctx.registry.sample_buffer(&group, &reading.sensor_id))
                .record(score.features);
            if let Some(every) = ctx.retrain_every {
                if since % every == 0 {
                    let request = RetrainRequest {
                        group: group.clone(),
                        trigger: RetrainTrigger::SampleCount,
                    };
                    if ctx.retrain_tx.try_send(request).is_err() {
                        debug!(group = %group, "Retrain queue full, sample-count trigger dropped");
                    }
                }
            }
        }

        trace!(
            sensor = %reading.sensor_id,
            seq = reading.sequence_no,
            z = score.statistical_score,
            combined = score.combined_score,
            class = %score.classification,
            "Reading scored"
        );

        // Event time has moved on: an alert quiet for the whole quiet period
        // resolves before this reading is counted, so a later anomaly opens a
        // new alert instead of reviving the old one.
        let mut transitions: Vec<AlertTransition> =
            self.alerts.sweep(reading.timestamp).into_iter().collect();
        transitions.extend(self.alerts.observe(score.classification, reading.timestamp));

        ProcessOutcome {
            validation,
            cleaned: Some(CleanedReading {
                reading,
                score,
                window_len,
            }),
            transitions,
        }
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) -> Option<AlertTransition> {
        self.alerts.sweep(now)
    }

    pub fn acknowledge(&mut self, alert_id: Uuid, now: DateTime<Utc>) -> Result<Option<AlertTransition>, AlertError> {
        self.alerts.acknowledge(alert_id, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertState, TransitionKind};
    use crate::validate::RejectReason;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn processor(config: &PipelineConfig, id: &str, ty: SensorType) -> (SensorProcessor, mpsc::Receiver<RetrainRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let ctx = SensorContext::new(
            config,
            Arc::new(ModelRegistry::new(config.model.snapshot_size)),
            Arc::new(QualityCounters::default()),
            tx,
        );
        (SensorProcessor::new(Arc::new(ctx), id, ty), rx)
    }

    fn temp(seq: u64, value: f64) -> Reading {
        Reading::new(
            "temp-1",
            SensorType::Temperature,
            value,
            t0() + Duration::minutes(seq as i64),
            seq,
        )
    }

    #[test]
    fn test_rejected_first_reading_creates_no_state() {
        let config = PipelineConfig::default();
        let (mut p, _rx) = processor(&config, "hum-2", SensorType::Humidity);
        let out = p.process(Reading::new("hum-2", SensorType::Humidity, 150.0, t0(), 1));
        assert_eq!(out.validation.reason(), Some(RejectReason::OutOfRange));
        assert!(out.cleaned.is_none());
        assert!(out.transitions.is_empty());
        assert!(p.state().is_none());
        assert_eq!(p.ctx.quality.snapshot().out_of_range, 1);
    }

    #[test]
    fn test_duplicate_leaves_state_untouched() {
        let config = PipelineConfig::default();
        let (mut p, _rx) = processor(&config, "temp-1", SensorType::Temperature);
        p.process(temp(1, 21.0));
        p.process(temp(2, 21.5));
        let out = p.process(temp(2, 80.0));
        assert_eq!(out.validation.reason(), Some(RejectReason::DuplicateSequence));
        let state = p.state().unwrap();
        assert_eq!(state.window().len(), 2);
        assert_eq!(state.window().latest(), Some(21.5));
    }

    #[test]
    fn test_type_change_rejected_without_touching_state() {
        let config = PipelineConfig::default();
        let (mut p, _rx) = processor(&config, "temp-1", SensorType::Temperature);
        for i in 0..20u64 {
            p.process(temp(i + 1, 22.0));
        }
        let out = p.process(Reading::new("temp-1", SensorType::Humidity, 60.0, t0() + Duration::minutes(21), 21));
        assert_eq!(out.validation.reason(), Some(RejectReason::Malformed));
        assert!(out.cleaned.is_none());
        assert!(out.transitions.is_empty());
        assert_eq!(p.state().unwrap().window().len(), 20);
        assert_eq!(p.state().unwrap().sensor_type(), SensorType::Temperature);
        assert_eq!(p.ctx.quality.snapshot().malformed, 1);
    }

    #[test]
    fn test_spike_opens_single_critical_alert() {
        let config = PipelineConfig::default();
        let (mut p, _rx) = processor(&config, "temp-1", SensorType::Temperature);
        for i in 0..20u64 {
            let out = p.process(temp(i + 1, 21.0 + 0.1 * ((i % 5) as f64 - 2.0)));
            assert!(out.transitions.is_empty());
        }
        let out = p.process(temp(21, 35.0));
        let cleaned = out.cleaned.unwrap();
        assert_eq!(cleaned.score.classification, Classification::Critical);
        assert_eq!(cleaned.window_len, 21);
        assert_eq!(out.transitions.len(), 1);
        let tr = &out.transitions[0];
        assert_eq!(tr.kind, TransitionKind::Opened);
        assert_eq!(tr.alert.occurrence_count, 1);
        assert_eq!(tr.alert.state, AlertState::Open);
    }

    #[test]
    fn test_quiet_alert_resolves_before_next_anomaly() {
        let config = PipelineConfig::default();
        let (mut p, _rx) = processor(&config, "temp-1", SensorType::Temperature);
        for i in 0..20u64 {
            p.process(temp(i + 1, 21.0 + 0.1 * ((i % 5) as f64 - 2.0)));
        }
        let first = p.process(temp(21, 35.0)).transitions[0].alert.alert_id;

        // Two hours of normal readings, then a second spike.
        for i in 22..140u64 {
            p.process(temp(i, 21.0 + 0.1 * ((i % 5) as f64 - 2.0)));
        }
        assert!(p.alerts().current().is_none());
        let out = p.process(temp(140, 35.0));
        let kinds: Vec<TransitionKind> = out.transitions.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TransitionKind::Opened]);
        assert_ne!(out.transitions[0].alert.alert_id, first);
        assert_eq!(out.transitions[0].alert.occurrence_count, 1);
    }

    #[test]
    fn test_rejected_readings_do_not_advance_event_clock() {
        let config = PipelineConfig::default();
        let (mut p, _rx) = processor(&config, "temp-1", SensorType::Temperature);
        p.process(temp(1, 21.0));
        p.process(Reading::new("temp-1", SensorType::Temperature, 900.0, t0() + Duration::days(365), 2));
        assert_eq!(p.ctx.latest_accepted(), Some(t0() + Duration::minutes(1)));
    }

    #[test]
    fn test_sample_count_requests_retrain() {
        let mut config = PipelineConfig::default();
        config.model.retrain_every_samples = Some(5);
        let (mut p, mut rx) = processor(&config, "temp-1", SensorType::Temperature);
        // min_history readings build the baseline, then 5 more are sampled.
        for i in 0..15u64 {
            p.process(temp(i + 1, 21.0 + 0.1 * (i % 3) as f64));
        }
        let req = rx.try_recv().expect("retrain requested");
        assert_eq!(req.trigger, RetrainTrigger::SampleCount);
        assert_eq!(req.group, ModelGroup::Type(SensorType::Temperature));
    }
}

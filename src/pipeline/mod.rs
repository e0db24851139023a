//! Pipeline orchestrator.
//!
//! Readings are routed by `sensor_id` to a per-sensor worker that is spawned
//! on first sight. Workers share nothing mutable on the hot path except the
//! atomically swapped model slot and the data-quality counters.

pub mod processor;
pub mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{AlertError, AlertEvent, AlertTransition};
use crate::config::{ConfigError, PipelineConfig};
use crate::detect::registry::{ModelRegistry, ModelSummary};
use crate::detect::trainer::{run_retrain_loop, RetrainOutcome, RetrainRequest, RetrainSchedule, RetrainTrigger, Trainer};
use crate::detect::ModelGroup;
use crate::ingest::Reading;
use crate::validate::{QualityCounters, QualitySnapshot};

pub use self::processor::{CleanedReading, ProcessOutcome, SensorContext, SensorProcessor};
use self::worker::{run_sensor_worker, AlertIndex, Emitter, SensorCommand};

const WORKER_QUEUE: usize = 256;
const RETRAIN_QUEUE: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("pipeline is closed")]
    Closed,
    #[error(transparent)]
    Alert(#[from] AlertError),
    #[error("unknown model group: {0}")]
    UnknownGroup(String),
    #[error("sensor limit of {0} reached, new sensor not tracked")]
    SensorLimit(usize),
}

/// Receiving ends of the pipeline's two output streams. Both must be drained
/// or workers stall once the channels fill.
pub struct PipelineOutputs {
    pub readings: mpsc::Receiver<CleanedReading>,
    pub alerts: mpsc::Receiver<AlertTransition>,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    ctx: Arc<SensorContext>,
    quality: Arc<QualityCounters>,
    trainer: Arc<Trainer>,
    alerts: Arc<AlertIndex>,
    workers: Mutex<HashMap<String, mpsc::Sender<SensorCommand>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    emitter: Mutex<Option<Emitter>>,
    retrain_rx: Mutex<Option<mpsc::Receiver<RetrainRequest>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Pipeline {
    /// Validate `config` and build an idle pipeline. Nothing runs until the
    /// first reading arrives or [`Pipeline::spawn_background`] is called.
    pub fn new(config: PipelineConfig) -> Result<(Self, PipelineOutputs), ConfigError> {
        config.validate()?;

        let capacity = config.output.channel_capacity;
        let (readings_tx, readings_rx) = mpsc::channel(capacity);
        let (alerts_tx, alerts_rx) = mpsc::channel(capacity);
        let (retrain_tx, retrain_rx) = mpsc::channel(RETRAIN_QUEUE);

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ModelRegistry::new(config.model.snapshot_size));
        let quality = Arc::new(QualityCounters::default());
        let trainer = Arc::new(Trainer::new(registry.clone(), &config.model, shutdown.clone()));
        let ctx = Arc::new(SensorContext::new(&config, registry, quality.clone(), retrain_tx));
        let alerts = Arc::new(AlertIndex::default());

        let emitter = Emitter {
            readings: readings_tx,
            alerts: alerts_tx,
            index: alerts.clone(),
        };

        let inner = Inner {
            config,
            ctx,
            quality,
            trainer,
            alerts,
            workers: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            emitter: Mutex::new(Some(emitter)),
            retrain_rx: Mutex::new(Some(retrain_rx)),
            shutdown,
            closed: AtomicBool::new(false),
        };

        Ok((
            Self { inner: Arc::new(inner) },
            PipelineOutputs {
                readings: readings_rx,
                alerts: alerts_rx,
            },
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    fn worker_for(&self, reading: &Reading) -> Result<mpsc::Sender<SensorCommand>, PipelineError> {
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = workers.get(&reading.sensor_id) {
            return Ok(tx.clone());
        }

        let limit = self.inner.config.stream.max_sensors;
        if workers.len() >= limit {
            return Err(PipelineError::SensorLimit(limit));
        }

        let emitter = self
            .inner
            .emitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PipelineError::Closed)?;

        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
        let processor = SensorProcessor::new(self.inner.ctx.clone(), &reading.sensor_id, reading.sensor_type);
        let handle = tokio::spawn(run_sensor_worker(reading.sensor_id.clone(), processor, rx, emitter));
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        info!(sensor = %reading.sensor_id, sensor_type = %reading.sensor_type, "New sensor");
        workers.insert(reading.sensor_id.clone(), tx.clone());
        Ok(tx)
    }

    fn worker_by_id(&self, sensor_id: &str) -> Option<mpsc::Sender<SensorCommand>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sensor_id)
            .cloned()
    }

    fn all_workers(&self) -> Vec<mpsc::Sender<SensorCommand>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Queue a reading for its sensor's worker. Waits if that worker is
    /// backed up.
    pub async fn ingest(&self, reading: Reading) -> Result<(), PipelineError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        let tx = self.worker_for(&reading)?;
        tx.send(SensorCommand::Ingest(reading))
            .await
            .map_err(|_| PipelineError::Closed)
    }

    /// Count an input record that could not be decoded into a reading.
    pub fn record_undecodable(&self) {
        self.inner.quality.record_undecodable();
    }

    /// Latest timestamp of an accepted reading. Rejected readings never
    /// move this clock.
    pub fn latest_event_time(&self) -> Option<DateTime<Utc>> {
        self.inner.ctx.latest_accepted()
    }

    /// Wait until every worker has applied everything queued so far.
    pub async fn drain(&self) {
        let flushes = self.all_workers().into_iter().map(|tx| async move {
            let (done, rx) = oneshot::channel();
            if tx.send(SensorCommand::Flush(done)).await.is_ok() {
                let _ = rx.await;
            }
        });
        join_all(flushes).await;
    }

    pub async fn acknowledge(&self, alert_id: Uuid) -> Result<AlertEvent, PipelineError> {
        let Some(alert) = self.inner.alerts.get(&alert_id) else {
            if self.inner.alerts.was_resolved(&alert_id) {
                return Err(AlertError::AlreadyResolved(alert_id).into());
            }
            return Err(AlertError::NotFound(alert_id).into());
        };
        let tx = self
            .worker_by_id(&alert.sensor_id)
            .ok_or(AlertError::NotFound(alert_id))?;

        let (reply, rx) = oneshot::channel();
        tx.send(SensorCommand::Acknowledge {
            alert_id,
            now: Utc::now(),
            reply,
        })
        .await
        .map_err(|_| PipelineError::Closed)?;

        let event = rx.await.map_err(|_| PipelineError::Closed)??;
        info!(alert = %alert_id, sensor = %event.sensor_id, "Alert acknowledged");
        Ok(event)
    }

    /// Retrain a known model group now, bypassing the schedule.
    pub async fn force_retrain(&self, group: &ModelGroup) -> Result<RetrainOutcome, PipelineError> {
        if !self.inner.trainer.registry().groups().contains(group) {
            return Err(PipelineError::UnknownGroup(group.to_string()));
        }
        Ok(self.inner.trainer.retrain(group, RetrainTrigger::Forced).await)
    }

    /// Resolve every alert that has been quiet since `now - quiet_period`.
    /// Returns how many were resolved.
    pub async fn sweep_alerts(&self, now: DateTime<Utc>) -> usize {
        let sweeps = self.all_workers().into_iter().map(|tx| async move {
            let (done, rx) = oneshot::channel();
            if tx.send(SensorCommand::Sweep { now, done }).await.is_err() {
                return false;
            }
            rx.await.unwrap_or(false)
        });
        let resolved = join_all(sweeps).await.into_iter().filter(|r| *r).count();
        if resolved > 0 {
            info!(resolved, "Quiet alerts resolved");
        }
        resolved
    }

    pub fn quality(&self) -> QualitySnapshot {
        self.inner.quality.snapshot()
    }

    pub fn active_alerts(&self) -> Vec<AlertEvent> {
        self.inner.alerts.active()
    }

    pub fn models(&self) -> Vec<ModelSummary> {
        self.inner.trainer.registry().summaries()
    }

    pub fn sensor_count(&self) -> usize {
        self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Start the alert sweep and retrain scheduler. Both stop when `cancel`
    /// fires or the pipeline is closed.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.spawn_sweeper(cancel.clone())];
        handles.extend(self.spawn_retrain_scheduler(cancel));
        handles
    }

    /// Child of `cancel` that also fires when the pipeline closes.
    fn background_token(&self, cancel: &CancellationToken) -> CancellationToken {
        let token = cancel.child_token();
        let shutdown = self.inner.shutdown.clone();
        let linked = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        token
    }

    /// Periodic wall-clock alert sweep.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let token = self.background_token(&cancel);
        let every = Duration::from_secs(self.inner.config.alerts.sweep_interval_secs.max(1));
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        pipeline.sweep_alerts(Utc::now()).await;
                    }
                }
            }
            debug!("Alert sweep loop stopped");
        })
    }

    /// Scheduled and sample-count retraining. Only one scheduler can run per
    /// pipeline; later calls return `None`.
    pub fn spawn_retrain_scheduler(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let rx = self
            .inner
            .retrain_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            warn!("Retrain scheduler already running, not starting another");
            return None;
        };
        let token = self.background_token(&cancel);
        let schedule = RetrainSchedule::from_config(&self.inner.config.model);
        Some(tokio::spawn(run_retrain_loop(
            self.inner.trainer.clone(),
            rx,
            schedule,
            token,
        )))
    }

    /// Stop accepting input, let every worker drain its queue, then close the
    /// output streams.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.inner.emitter.lock().unwrap_or_else(PoisonError::into_inner).take();

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let total = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sensor worker ended abnormally");
            }
        }
        self.inner.shutdown.cancel();
        info!(sensors = total, "Pipeline closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::TransitionKind;
    use crate::ingest::SensorType;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t(mins: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(mins)
    }

    #[tokio::test]
    async fn test_readings_flow_to_outputs_in_order() {
        let (pipeline, mut out) = Pipeline::new(PipelineConfig::default()).unwrap();
        for i in 1..=5u64 {
            pipeline
                .ingest(Reading::new("a", SensorType::Humidity, 40.0 + i as f64, t(i as i64), i))
                .await
                .unwrap();
            pipeline
                .ingest(Reading::new("b", SensorType::Pressure, 1000.0, t(i as i64), i))
                .await
                .unwrap();
        }
        pipeline.close().await;

        let mut seen_a = Vec::new();
        while let Some(c) = out.readings.recv().await {
            if c.reading.sensor_id == "a" {
                seen_a.push(c.reading.sequence_no);
            }
        }
        assert_eq!(seen_a, vec![1, 2, 3, 4, 5]);
        assert_eq!(pipeline.quality().accepted, 10);
        assert_eq!(pipeline.sensor_count(), 0);
        assert_eq!(
            pipeline.ingest(Reading::new("a", SensorType::Humidity, 1.0, t(9), 9)).await,
            Err(PipelineError::Closed)
        );
    }

    #[tokio::test]
    async fn test_acknowledge_and_sweep_via_workers() {
        let (pipeline, mut out) = Pipeline::new(PipelineConfig::default()).unwrap();
        for i in 0..20u64 {
            let v = 21.0 + 0.1 * ((i % 5) as f64 - 2.0);
            pipeline
                .ingest(Reading::new("temp-1", SensorType::Temperature, v, t(i as i64), i + 1))
                .await
                .unwrap();
        }
        pipeline
            .ingest(Reading::new("temp-1", SensorType::Temperature, 35.0, t(20), 21))
            .await
            .unwrap();

        let opened = out.alerts.recv().await.unwrap();
        assert_eq!(opened.kind, TransitionKind::Opened);
        assert_eq!(pipeline.active_alerts().len(), 1);

        let acked = pipeline.acknowledge(opened.alert.alert_id).await.unwrap();
        assert!(acked.acknowledged_at.is_some());
        assert_eq!(out.alerts.recv().await.unwrap().kind, TransitionKind::Acknowledged);

        assert_eq!(pipeline.sweep_alerts(t(25)).await, 0);
        assert_eq!(pipeline.sweep_alerts(t(40)).await, 1);
        assert_eq!(pipeline.sweep_alerts(t(60)).await, 0);
        assert!(pipeline.active_alerts().is_empty());
        assert_eq!(
            pipeline.acknowledge(opened.alert.alert_id).await,
            Err(PipelineError::Alert(AlertError::AlreadyResolved(opened.alert.alert_id)))
        );

        let unknown = Uuid::new_v4();
        assert_eq!(
            pipeline.acknowledge(unknown).await,
            Err(PipelineError::Alert(AlertError::NotFound(unknown)))
        );
    }

    #[tokio::test]
    async fn test_force_retrain_unknown_group() {
        let (pipeline, _out) = Pipeline::new(PipelineConfig::default()).unwrap();
        let err = pipeline
            .force_retrain(&ModelGroup::Type(SensorType::Pressure))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::UnknownGroup("pressure".into()));
    }

    #[tokio::test]
    async fn test_background_loops_stop_on_cancel() {
        let (pipeline, _out) = Pipeline::new(PipelineConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        let handles = pipeline.spawn_background(cancel.clone());
        assert_eq!(handles.len(), 2);
        cancel.cancel();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_new_sensors_beyond_limit_are_refused() {
        let mut config = PipelineConfig::default();
        config.stream.max_sensors = 2;
        let (pipeline, mut out) = Pipeline::new(config).unwrap();
        for id in ["a", "b"] {
            pipeline
                .ingest(Reading::new(id, SensorType::Humidity, 40.0, t(0), 1))
                .await
                .unwrap();
        }
        assert_eq!(
            pipeline
                .ingest(Reading::new("c", SensorType::Humidity, 40.0, t(0), 1))
                .await,
            Err(PipelineError::SensorLimit(2))
        );
        // Known sensors keep flowing.
        pipeline
            .ingest(Reading::new("a", SensorType::Humidity, 41.0, t(1), 2))
            .await
            .unwrap();
        assert_eq!(pipeline.sensor_count(), 2);

        pipeline.close().await;
        let mut ids = Vec::new();
        while let Some(c) = out.readings.recv().await {
            ids.push(c.reading.sensor_id);
        }
        assert_eq!(ids.len(), 3);
        assert!(!ids.iter().any(|id| id == "c"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.stream.window_capacity = 0;
        assert!(Pipeline::new(config).is_err());
    }
}

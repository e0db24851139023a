//! Model retraining: snapshot, fit off the async runtime, swap.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;

use super::forest::{ForestParams, IsolationForest};
use super::registry::ModelRegistry;
use super::{ModelFitError, ModelGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainTrigger {
    Interval,
    Cron,
    SampleCount,
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrainRequest {
    pub group: ModelGroup,
    pub trigger: RetrainTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    InsufficientSamples { needed: usize, have: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetrainOutcome {
    Swapped { version: u64, samples: usize },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

pub struct Trainer {
    registry: Arc<ModelRegistry>,
    params: ForestParams,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl Trainer {
    pub fn new(registry: Arc<ModelRegistry>, config: &ModelConfig, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            params: ForestParams {
                trees: config.trees,
                subsample_size: config.subsample_size,
                min_samples: config.min_training_samples,
                seed: config.seed,
            },
            timeout: Duration::from_secs(config.retrain_timeout_secs),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Refit the model for `group` from a copy of its recent samples.
    ///
    /// Never runs twice at once for the same group. Any failure leaves the
    /// current model in place.
    pub async fn retrain(&self, group: &ModelGroup, trigger: RetrainTrigger) -> RetrainOutcome {
        let Some(guard) = self.registry.try_begin(group) else {
            debug!(group = %group, ?trigger, "Retrain already running, skipping");
            return RetrainOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
            };
        };

        let samples = self.registry.snapshot(group);
        let needed = self.params.min_samples.max(2);
        if samples.len() < needed {
            info!(group = %group, ?trigger, have = samples.len(), needed, "Not enough samples to retrain");
            return RetrainOutcome::Skipped {
                reason: SkipReason::InsufficientSamples {
                    needed,
                    have: samples.len(),
                },
            };
        }

        let started = Utc::now();
        let cancel = self.shutdown.child_token();
        let params = self.params.clone();
        let fit_cancel = cancel.clone();
        // The guard travels with the fit so the group stays claimed until the
        // blocking thread is done, even if we stop waiting for it.
        let handle = tokio::task::spawn_blocking(move || {
            let result = IsolationForest::fit(&samples, &params, &fit_cancel);
            (result, samples.len(), guard)
        });

        let result = match tokio::time::timeout(self.timeout, handle).await {
            Err(_) => {
                cancel.cancel();
                Err(ModelFitError::TimedOut(self.timeout))
            }
            Ok(Err(join)) => Err(ModelFitError::Task(join.to_string())),
            Ok(Ok((Err(e), _, _guard))) => Err(e),
            Ok(Ok((Ok(forest), n, guard))) => {
                debug!(group = %group, trees = forest.tree_count(), samples = n, "Forest fitted");
                let version = self.registry.install(group, forest, n);
                drop(guard);
                Ok((version, n))
            }
        };

        match result {
            Ok((version, samples)) => {
                let elapsed_ms = (Utc::now() - started).num_milliseconds();
                info!(group = %group, ?trigger, version, samples, elapsed_ms, "Model swapped");
                RetrainOutcome::Swapped { version, samples }
            }
            Err(e) => {
                warn!(group = %group, ?trigger, error = %e, "Retrain failed, keeping previous model");
                RetrainOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// When scheduled retrains fire.
#[derive(Debug, Clone)]
pub enum RetrainSchedule {
    Interval(Duration),
    Cron(cron::Schedule),
}

impl RetrainSchedule {
    /// Cron takes precedence over the fixed interval when both are set.
    /// The expression is assumed to have passed config validation.
    pub fn from_config(config: &ModelConfig) -> Self {
        config
            .retrain_cron
            .as_deref()
            .and_then(|expr| cron::Schedule::from_str(expr).ok())
            .map(RetrainSchedule::Cron)
            .unwrap_or_else(|| {
                RetrainSchedule::Interval(Duration::from_secs(config.retrain_interval_secs.max(1)))
            })
    }

    fn trigger(&self) -> RetrainTrigger {
        match self {
            RetrainSchedule::Interval(_) => RetrainTrigger::Interval,
            RetrainSchedule::Cron(_) => RetrainTrigger::Cron,
        }
    }

    /// Time until the next firing, or `None` if the schedule never fires again.
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            RetrainSchedule::Interval(every) => Some(*every),
            RetrainSchedule::Cron(schedule) => {
                let now = Utc::now();
                schedule
                    .after(&now)
                    .next()
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Serve retrain requests and scheduled retrains until `cancel` fires.
pub async fn run_retrain_loop(
    trainer: Arc<Trainer>,
    mut requests: mpsc::Receiver<RetrainRequest>,
    schedule: RetrainSchedule,
    cancel: CancellationToken,
) {
    info!(?schedule, "Retrain scheduler started");
    let mut next_due = schedule.next_delay().map(|d| Instant::now() + d);
    let mut requests_open = true;

    loop {
        let due = async {
            match next_due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            req = requests.recv(), if requests_open => match req {
                Some(RetrainRequest { group, trigger }) => {
                    let trainer = trainer.clone();
                    tokio::spawn(async move {
                        trainer.retrain(&group, trigger).await;
                    });
                }
                None => requests_open = false,
            },
            _ = due => {
                let groups = trainer.registry().groups();
                debug!(groups = groups.len(), "Scheduled retrain due");
                for group in groups {
                    let trainer = trainer.clone();
                    let trigger = schedule.trigger();
                    tokio::spawn(async move {
                        trainer.retrain(&group, trigger).await;
                    });
                }
                next_due = schedule.next_delay().map(|d| Instant::now() + d);
            }
        }
    }
    info!("Retrain scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::FeatureVector;
    use crate::ingest::SensorType;

    fn config() -> ModelConfig {
        ModelConfig {
            min_training_samples: 20,
            trees: 20,
            subsample_size: 32,
            seed: Some(9),
            ..ModelConfig::default()
        }
    }

    fn group() -> ModelGroup {
        ModelGroup::Type(SensorType::AirQuality)
    }

    fn feed(registry: &ModelRegistry, n: usize) {
        let buf = registry.sample_buffer(&group(), "aq-1");
        for i in 0..n {
            let v = 40.0 + (i % 11) as f64;
            buf.record(FeatureVector([v, v - 45.0, 0.1 * (i % 3) as f64]));
        }
    }

    #[tokio::test]
    async fn test_too_few_samples_is_skipped() {
        let registry = Arc::new(ModelRegistry::new(64));
        feed(&registry, 5);
        let trainer = Trainer::new(registry.clone(), &config(), CancellationToken::new());

        let outcome = trainer.retrain(&group(), RetrainTrigger::Forced).await;
        assert_eq!(
            outcome,
            RetrainOutcome::Skipped {
                reason: SkipReason::InsufficientSamples { needed: 20, have: 5 }
            }
        );
        assert!(registry.current(&group()).is_none());
        // The claim is released after a skip.
        assert!(registry.try_begin(&group()).is_some());
    }

    #[tokio::test]
    async fn test_retrain_swaps_and_keeps_model_on_failure() {
        let registry = Arc::new(ModelRegistry::new(64));
        feed(&registry, 40);
        let trainer = Trainer::new(registry.clone(), &config(), CancellationToken::new());

        let outcome = trainer.retrain(&group(), RetrainTrigger::Forced).await;
        assert_eq!(outcome, RetrainOutcome::Swapped { version: 1, samples: 40 });

        // Flood the history with a constant so the next fit is degenerate.
        let buf = registry.sample_buffer(&group(), "aq-1");
        for _ in 0..64 {
            buf.record(FeatureVector([1.0, 0.0, 0.0]));
        }
        let outcome = trainer.retrain(&group(), RetrainTrigger::Interval).await;
        assert!(matches!(outcome, RetrainOutcome::Failed { .. }));
        assert_eq!(registry.current(&group()).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_retrain_is_skipped() {
        let registry = Arc::new(ModelRegistry::new(64));
        feed(&registry, 40);
        let trainer = Trainer::new(registry.clone(), &config(), CancellationToken::new());

        let _held = registry.try_begin(&group()).unwrap();
        let outcome = trainer.retrain(&group(), RetrainTrigger::Forced).await;
        assert_eq!(
            outcome,
            RetrainOutcome::Skipped {
                reason: SkipReason::AlreadyRunning
            }
        );
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let registry = Arc::new(ModelRegistry::new(64));
        let cancel = CancellationToken::new();
        let trainer = Arc::new(Trainer::new(registry, &config(), cancel.clone()));
        let (_tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_retrain_loop(
            trainer,
            rx,
            RetrainSchedule::Interval(Duration::from_secs(3600)),
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits")
            .unwrap();
    }

    #[test]
    fn test_schedule_prefers_cron() {
        let mut cfg = config();
        assert!(matches!(RetrainSchedule::from_config(&cfg), RetrainSchedule::Interval(d) if d == Duration::from_secs(3600)));
        cfg.retrain_cron = Some("0 0 * * * *".into());
        let schedule = RetrainSchedule::from_config(&cfg);
        assert!(matches!(schedule, RetrainSchedule::Cron(_)));
        assert!(schedule.next_delay().unwrap() <= Duration::from_secs(3600));
    }
}

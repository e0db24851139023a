//! One actor task per sensor. Readings, sweeps and acknowledgments for a
//! sensor all arrive on the same channel, so they are applied in order and
//! never concurrently.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use uuid::Uuid;

use crate::alert::{AlertError, AlertEvent, AlertTransition};
use crate::ingest::Reading;

use super::processor::{CleanedReading, SensorProcessor};

pub enum SensorCommand {
    Ingest(Reading),
    Sweep {
        now: DateTime<Utc>,
        done: oneshot::Sender<bool>,
    },
    Acknowledge {
        alert_id: Uuid,
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<AlertEvent, AlertError>>,
    },
    /// Replies once every command queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

/// Resolved alert ids remembered for late acknowledgments.
const RESOLVED_MEMORY: usize = 1024;

/// Non-resolved alerts across all sensors, keyed by id, plus the ids of the
/// most recently resolved ones.
#[derive(Debug, Default)]
pub struct AlertIndex {
    alerts: RwLock<HashMap<Uuid, AlertEvent>>,
    resolved: RwLock<VecDeque<Uuid>>,
}

impl AlertIndex {
    pub fn apply(&self, transition: &AlertTransition) {
        let id = transition.alert.alert_id;
        if transition.alert.state.is_terminal() {
            self.alerts.write().unwrap_or_else(PoisonError::into_inner).remove(&id);
            let mut resolved = self.resolved.write().unwrap_or_else(PoisonError::into_inner);
            if resolved.len() == RESOLVED_MEMORY {
                resolved.pop_front();
            }
            resolved.push_back(id);
        } else {
            self.alerts
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, transition.alert.clone());
        }
    }

    pub fn was_resolved(&self, alert_id: &Uuid) -> bool {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(alert_id)
    }

    pub fn get(&self, alert_id: &Uuid) -> Option<AlertEvent> {
        self.alerts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alert_id)
            .cloned()
    }

    /// Active alerts, most recently seen first.
    pub fn active(&self) -> Vec<AlertEvent> {
        let mut alerts: Vec<AlertEvent> = self
            .alerts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.last_seen_ts.cmp(&a.last_seen_ts));
        alerts
    }
}

/// Output channels shared by every worker.
#[derive(Clone)]
pub struct Emitter {
    pub readings: mpsc::Sender<CleanedReading>,
    pub alerts: mpsc::Sender<AlertTransition>,
    pub index: Arc<AlertIndex>,
}

impl Emitter {
    async fn alert(&self, transition: AlertTransition) {
        self.index.apply(&transition);
        if self.alerts.send(transition).await.is_err() {
            debug!("Alert receiver dropped");
        }
    }

    async fn reading(&self, cleaned: CleanedReading) {
        if self.readings.send(cleaned).await.is_err() {
            debug!("Cleaned-reading receiver dropped");
        }
    }
}

/// Run `f`, converting a panic into `None` so one bad reading cannot take the
/// worker down.
pub(crate) fn run_guarded<T>(sensor_id: &str, what: &str, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Some(v),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(sensor = %sensor_id, %what, panic = %msg, "Sensor processing panicked, input dropped");
            None
        }
    }
}

pub async fn run_sensor_worker(
    sensor_id: String,
    mut processor: SensorProcessor,
    mut commands: mpsc::Receiver<SensorCommand>,
    emit: Emitter,
) {
    debug!(sensor = %sensor_id, "Sensor worker started");

    while let Some(cmd) = commands.recv().await {
        match cmd {
            SensorCommand::Ingest(reading) => {
                let Some(outcome) = run_guarded(&sensor_id, "reading", || processor.process(reading)) else {
                    continue;
                };
                if let Some(cleaned) = outcome.cleaned {
                    emit.reading(cleaned).await;
                }
                for transition in outcome.transitions {
                    emit.alert(transition).await;
                }
            }
            SensorCommand::Sweep { now, done } => {
                let transition = run_guarded(&sensor_id, "sweep", || processor.sweep(now)).flatten();
                let resolved = transition.is_some();
                if let Some(transition) = transition {
                    emit.alert(transition).await;
                }
                let _ = done.send(resolved);
            }
            SensorCommand::Acknowledge { alert_id, now, reply } => {
                let result = run_guarded(&sensor_id, "acknowledge", || processor.acknowledge(alert_id, now))
                    .unwrap_or(Err(AlertError::NotFound(alert_id)));
                let response = match result {
                    Ok(Some(transition)) => {
                        let alert = transition.alert.clone();
                        emit.alert(transition).await;
                        Ok(alert)
                    }
                    Ok(None) => processor
                        .alerts()
                        .current()
                        .cloned()
                        .ok_or(AlertError::NotFound(alert_id)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(response);
            }
            SensorCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!(sensor = %sensor_id, "Sensor worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_is_contained() {
        let out: Option<u32> = run_guarded("temp-1", "reading", || panic!("boom"));
        assert_eq!(out, None);
        assert_eq!(run_guarded("temp-1", "reading", || 7), Some(7));
    }
}

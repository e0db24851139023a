//! Per-sensor alert lifecycle: open, escalate, acknowledge, resolve.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::detect::Classification;
use crate::ingest::SensorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    /// `None` for a normal classification.
    pub fn from_classification(c: Classification) -> Option<Self> {
        match c {
            Classification::Normal => None,
            Classification::Warning => Some(Severity::Warning),
            Classification::Critical => Some(Severity::Critical),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Open,
    Escalated,
    Acknowledged,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Open => "open",
            AlertState::Escalated => "escalated",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Resolved => "resolved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertState::Resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub alert_id: Uuid,
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub first_seen_ts: DateTime<Utc>,
    pub last_seen_ts: DateTime<Utc>,
    pub severity: Severity,
    pub occurrence_count: u64,
    pub state: AlertState,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Opened,
    Updated,
    Escalated,
    Acknowledged,
    Resolved,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Opened => "opened",
            TransitionKind::Updated => "updated",
            TransitionKind::Escalated => "escalated",
            TransitionKind::Acknowledged => "acknowledged",
            TransitionKind::Resolved => "resolved",
        }
    }
}

/// An alert delta, carrying the alert as it stands after the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertTransition {
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
    pub alert: AlertEvent,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(Uuid),
    #[error("alert {0} is already resolved")]
    AlreadyResolved(Uuid),
}

#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub escalation_occurrences: u64,
    pub quiet_period: Duration,
}

impl From<&AlertConfig> for AlertPolicy {
    fn from(config: &AlertConfig) -> Self {
        Self {
            escalation_occurrences: u64::from(config.escalation_occurrences),
            quiet_period: config.quiet_period(),
        }
    }
}

/// Alert state for a single sensor. Holds at most one non-resolved alert.
#[derive(Debug, Clone)]
pub struct AlertTracker {
    sensor_id: String,
    sensor_type: SensorType,
    policy: AlertPolicy,
    current: Option<AlertEvent>,
    last_resolved: Option<Uuid>,
}

impl AlertTracker {
    pub fn new(sensor_id: impl Into<String>, sensor_type: SensorType, policy: AlertPolicy) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type,
            policy,
            current: None,
            last_resolved: None,
        }
    }

    pub fn current(&self) -> Option<&AlertEvent> {
        self.current.as_ref()
    }

    /// Feed one classification observed at `ts`.
    pub fn observe(&mut self, classification: Classification, ts: DateTime<Utc>) -> Option<AlertTransition> {
        let severity = Severity::from_classification(classification)?;

        let Some(alert) = self.current.as_mut() else {
            let alert = AlertEvent {
                alert_id: Uuid::new_v4(),
                sensor_id: self.sensor_id.clone(),
                sensor_type: self.sensor_type,
                first_seen_ts: ts,
                last_seen_ts: ts,
                severity,
                occurrence_count: 1,
                state: AlertState::Open,
                acknowledged_at: None,
                resolved_at: None,
            };
            self.current = Some(alert.clone());
            return Some(AlertTransition {
                kind: TransitionKind::Opened,
                at: ts,
                alert,
            });
        };

        alert.occurrence_count += 1;
        alert.last_seen_ts = alert.last_seen_ts.max(ts);

        let kind = match alert.state {
            AlertState::Acknowledged => TransitionKind::Updated,
            _ => {
                let upgraded = severity > alert.severity;
                if upgraded {
                    alert.severity = severity;
                }
                let crossed = alert.state == AlertState::Open
                    && alert.occurrence_count >= self.policy.escalation_occurrences;
                if upgraded || crossed {
                    alert.state = AlertState::Escalated;
                    TransitionKind::Escalated
                } else {
                    TransitionKind::Updated
                }
            }
        };

        Some(AlertTransition {
            kind,
            at: ts,
            alert: alert.clone(),
        })
    }

    /// Acknowledge the current alert. Acknowledging twice is a no-op.
    pub fn acknowledge(&mut self, alert_id: Uuid, now: DateTime<Utc>) -> Result<Option<AlertTransition>, AlertError> {
        let Some(alert) = self.current.as_mut().filter(|a| a.alert_id == alert_id) else {
            if self.last_resolved == Some(alert_id) {
                return Err(AlertError::AlreadyResolved(alert_id));
            }
            return Err(AlertError::NotFound(alert_id));
        };
        match alert.state {
            AlertState::Resolved => Err(AlertError::AlreadyResolved(alert_id)),
            AlertState::Acknowledged => Ok(None),
            AlertState::Open | AlertState::Escalated => {
                alert.state = AlertState::Acknowledged;
                alert.acknowledged_at = Some(now);
                Ok(Some(AlertTransition {
                    kind: TransitionKind::Acknowledged,
                    at: now,
                    alert: alert.clone(),
                }))
            }
        }
    }

    /// Resolve the current alert if it has been quiet for the quiet period.
    /// The tracker forgets a resolved alert, so repeated sweeps are no-ops;
    /// only its id is kept to answer late acknowledgments.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Option<AlertTransition> {
        let quiet = self
            .current
            .as_ref()
            .is_some_and(|a| now - a.last_seen_ts >= self.policy.quiet_period);
        if !quiet {
            return None;
        }
        let mut alert = self.current.take()?;
        alert.state = AlertState::Resolved;
        alert.resolved_at = Some(now);
        self.last_resolved = Some(alert.alert_id);
        Some(AlertTransition {
            kind: TransitionKind::Resolved,
            at: now,
            alert,
        })
    }
}

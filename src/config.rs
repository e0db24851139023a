//! TOML configuration for the envsentry pipeline.
//!
//! Every section has compiled-in defaults, so an empty file is a valid
//! configuration. After parsing, [`PipelineConfig::validate`] checks the
//! cross-field invariants (threshold ordering, window sizes, cadences) and the
//! pipeline refuses to start on any [`ConfigError`].

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::ingest::SensorType;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "ENVSENTRY_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/envsentry/envsentry.toml";

/// Upper bound for every duration setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{sensor_type}: warning threshold {warning} must be below critical threshold {critical}")]
    ThresholdOrder {
        sensor_type: SensorType,
        warning: f64,
        critical: f64,
    },
    #[error("{sensor_type}: thresholds must be positive and finite (warning={warning}, critical={critical})")]
    ThresholdValue {
        sensor_type: SensorType,
        warning: f64,
        critical: f64,
    },
    #[error("{sensor_type}: invalid valid range [{min}, {max}]")]
    InvalidRange {
        sensor_type: SensorType,
        min: f64,
        max: f64,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} ({secs}s) exceeds the maximum of {max}s")]
    TooLong {
        field: &'static str,
        secs: u64,
        max: u64,
    },
    #[error("stream.min_history ({min_history}) must be between 2 and stream.window_capacity ({capacity})")]
    MinHistory { min_history: usize, capacity: usize },
    #[error("stream.slope_window ({slope_window}) must be between 2 and stream.window_capacity ({capacity})")]
    SlopeWindow { slope_window: usize, capacity: usize },
    #[error("model.blend_weight ({0}) must be within [0, 1]")]
    BlendWeight(f64),
    #[error("model.min_training_samples ({min}) must be between 2 and model.snapshot_size ({snapshot})")]
    TrainingWindow { min: usize, snapshot: usize },
    #[error("model.subsample_size must be at least 2 (got {0})")]
    Subsample(usize),
    #[error("invalid model.retrain_cron '{expr}': {reason}")]
    Cron { expr: String, reason: String },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub logging: LoggingConfig,
    pub validation: ValidationConfig,
    pub sensors: SensorsConfig,
    pub stream: StreamConfig,
    pub model: ModelConfig,
    pub alerts: AlertConfig,
    pub output: OutputConfig,
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. The path named by `ENVSENTRY_CONFIG`.
    /// 2. `/etc/envsentry/envsentry.toml`.
    /// 3. Compiled-in defaults.
    ///
    /// Unlike a missing file, an invalid file is always an error.
    pub fn load_or_default() -> Result<Self> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&env_path));
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            return Self::load(system_path);
        }

        debug!("no config file found, using compiled-in defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants. Called by every loader.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for sensor_type in SensorType::ALL {
            let p = self.sensors.profile(sensor_type);
            if !p.min.is_finite() || !p.max.is_finite() || p.min >= p.max {
                return Err(ConfigError::InvalidRange {
                    sensor_type,
                    min: p.min,
                    max: p.max,
                });
            }
            let thresholds_ok = p.warning_threshold.is_finite()
                && p.critical_threshold.is_finite()
                && p.warning_threshold > 0.0
                && p.critical_threshold > 0.0;
            if !thresholds_ok {
                return Err(ConfigError::ThresholdValue {
                    sensor_type,
                    warning: p.warning_threshold,
                    critical: p.critical_threshold,
                });
            }
            if p.warning_threshold >= p.critical_threshold {
                return Err(ConfigError::ThresholdOrder {
                    sensor_type,
                    warning: p.warning_threshold,
                    critical: p.critical_threshold,
                });
            }
        }

        let s = &self.stream;
        if s.window_capacity == 0 {
            return Err(ConfigError::Zero("stream.window_capacity"));
        }
        if s.max_sensors == 0 {
            return Err(ConfigError::Zero("stream.max_sensors"));
        }
        if s.min_history < 2 || s.min_history > s.window_capacity {
            return Err(ConfigError::MinHistory {
                min_history: s.min_history,
                capacity: s.window_capacity,
            });
        }
        if s.slope_window < 2 || s.slope_window > s.window_capacity {
            return Err(ConfigError::SlopeWindow {
                slope_window: s.slope_window,
                capacity: s.window_capacity,
            });
        }

        let m = &self.model;
        if !(0.0..=1.0).contains(&m.blend_weight) {
            return Err(ConfigError::BlendWeight(m.blend_weight));
        }
        if m.snapshot_size == 0 {
            return Err(ConfigError::Zero("model.snapshot_size"));
        }
        if m.min_training_samples < 2 || m.min_training_samples > m.snapshot_size {
            return Err(ConfigError::TrainingWindow {
                min: m.min_training_samples,
                snapshot: m.snapshot_size,
            });
        }
        if m.trees == 0 {
            return Err(ConfigError::Zero("model.trees"));
        }
        if m.subsample_size < 2 {
            return Err(ConfigError::Subsample(m.subsample_size));
        }
        if m.retrain_interval_secs == 0 {
            return Err(ConfigError::Zero("model.retrain_interval_secs"));
        }
        if m.retrain_timeout_secs == 0 {
            return Err(ConfigError::Zero("model.retrain_timeout_secs"));
        }
        if m.retrain_every_samples == Some(0) {
            return Err(ConfigError::Zero("model.retrain_every_samples"));
        }
        if let Some(expr) = &m.retrain_cron {
            cron::Schedule::from_str(expr).map_err(|e| ConfigError::Cron {
                expr: expr.clone(),
                reason: e.to_string(),
            })?;
        }

        let a = &self.alerts;
        if a.escalation_occurrences == 0 {
            return Err(ConfigError::Zero("alerts.escalation_occurrences"));
        }
        if a.quiet_period_secs == 0 {
            return Err(ConfigError::Zero("alerts.quiet_period_secs"));
        }
        if a.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("alerts.sweep_interval_secs"));
        }

        let durations = [
            ("validation.staleness_tolerance_secs", self.validation.staleness_tolerance_secs),
            ("model.retrain_interval_secs", m.retrain_interval_secs),
            ("model.retrain_timeout_secs", m.retrain_timeout_secs),
            ("alerts.quiet_period_secs", a.quiet_period_secs),
            ("alerts.sweep_interval_secs", a.sweep_interval_secs),
        ];
        for (field, secs) in durations {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::TooLong {
                    field,
                    secs,
                    max: MAX_DURATION_SECS,
                });
            }
        }

        if self.output.channel_capacity == 0 {
            return Err(ConfigError::Zero("output.channel_capacity"));
        }

        Ok(())
    }
}

/// Saturates instead of panicking; `validate` keeps real values far below.
fn chrono_secs(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// How far behind the latest accepted timestamp a reading may be.
    pub staleness_tolerance_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            staleness_tolerance_secs: 300,
        }
    }
}

impl ValidationConfig {
    pub fn staleness_tolerance(&self) -> chrono::Duration {
        chrono_secs(self.staleness_tolerance_secs)
    }
}

// ---------------------------------------------------------------------------
// Per sensor type
// ---------------------------------------------------------------------------

/// Per-type overrides. Any field left out falls back to the type's default
/// profile (see [`SensorProfile::default_for`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorTypeConfig {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub temperature: SensorTypeConfig,
    pub humidity: SensorTypeConfig,
    pub air_quality: SensorTypeConfig,
    pub pressure: SensorTypeConfig,
}

/// Fully resolved limits for one sensor type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorProfile {
    /// Hard plausibility bound; values outside are rejected as out of range.
    pub min: f64,
    pub max: f64,
    /// Combined-score thresholds, in standard deviations.
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl SensorProfile {
    pub fn default_for(sensor_type: SensorType) -> Self {
        let (min, max) = match sensor_type {
            SensorType::Temperature => (-40.0, 85.0),
            SensorType::Humidity => (0.0, 100.0),
            SensorType::AirQuality => (0.0, 500.0),
            SensorType::Pressure => (870.0, 1085.0),
        };
        Self {
            min,
            max,
            warning_threshold: 3.0,
            critical_threshold: 5.0,
        }
    }
}

impl SensorsConfig {
    fn overrides(&self, sensor_type: SensorType) -> &SensorTypeConfig {
        match sensor_type {
            SensorType::Temperature => &self.temperature,
            SensorType::Humidity => &self.humidity,
            SensorType::AirQuality => &self.air_quality,
            SensorType::Pressure => &self.pressure,
        }
    }

    pub fn profile(&self, sensor_type: SensorType) -> SensorProfile {
        let base = SensorProfile::default_for(sensor_type);
        let o = self.overrides(sensor_type);
        SensorProfile {
            min: o.min.unwrap_or(base.min),
            max: o.max.unwrap_or(base.max),
            warning_threshold: o.warning_threshold.unwrap_or(base.warning_threshold),
            critical_threshold: o.critical_threshold.unwrap_or(base.critical_threshold),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Rolling window capacity N.
    pub window_capacity: usize,
    /// Samples required before a reading can be classified as anomalous.
    pub min_history: usize,
    /// Number of trailing samples used for the short-term slope feature.
    pub slope_window: usize,
    /// Distinct sensors tracked at once. Each holds a worker task for the
    /// life of the pipeline; readings from sensors beyond the cap are dropped.
    pub max_sensors: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            window_capacity: 120,
            min_history: 10,
            slope_window: 5,
            max_sensors: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Granularity at which models are trained and shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelScope {
    SensorType,
    SensorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub scope: ModelScope,
    /// Weight of the model component in the combined score.
    pub blend_weight: f64,
    /// Most recent non-critical samples kept per group for retraining.
    pub snapshot_size: usize,
    pub min_training_samples: usize,
    pub retrain_interval_secs: u64,
    /// Six-field cron expression; replaces the interval when set.
    pub retrain_cron: Option<String>,
    /// Also retrain a group after this many new samples.
    pub retrain_every_samples: Option<u64>,
    pub retrain_timeout_secs: u64,
    pub trees: usize,
    pub subsample_size: usize,
    /// Fixed RNG seed for reproducible fits.
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            scope: ModelScope::SensorType,
            blend_weight: 0.3,
            snapshot_size: 512,
            min_training_samples: 64,
            retrain_interval_secs: 3600,
            retrain_cron: None,
            retrain_every_samples: None,
            retrain_timeout_secs: 30,
            trees: 100,
            subsample_size: 128,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Occurrences after which an open alert escalates.
    pub escalation_occurrences: u32,
    /// Anomaly-free time after which an alert resolves.
    pub quiet_period_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            escalation_occurrences: 5,
            quiet_period_secs: 600,
            sweep_interval_secs: 30,
        }
    }
}

impl AlertConfig {
    pub fn quiet_period(&self) -> chrono::Duration {
        chrono_secs(self.quiet_period_secs)
    }

    pub fn sweep_interval(&self) -> chrono::Duration {
        chrono_secs(self.sweep_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Bound of each output event channel.
    pub channel_capacity: usize,
    /// Print events to stdout as JSON lines.
    pub stdout: bool,
    /// Append events to an SQLite database at this path.
    pub sqlite_path: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            stdout: true,
            sqlite_path: None,
        }
    }
}

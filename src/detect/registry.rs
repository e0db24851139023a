//! Current model and training history per model group.
//!
//! The hot path only ever loads the current model (`ArcSwapOption::load_full`),
//! so a retrain swapping in a new version never blocks scoring and a reader
//! always sees either the old or the new model, never a partial one.
//!
//! Training samples are buffered per sensor. Each buffer has a single writer
//! (its sensor's worker), so recording a sample never waits on other sensors
//! of the same group; only a retrain snapshot briefly visits every buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::features::FeatureVector;
use super::forest::IsolationForest;
use super::ModelGroup;

/// An immutable, fitted model.
#[derive(Debug)]
pub struct TrainedModel {
    pub version: u64,
    pub forest: IsolationForest,
    pub trained_at: DateTime<Utc>,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub group: ModelGroup,
    pub version: Option<u64>,
    pub trained_at: Option<DateTime<Utc>>,
    pub trained_on: Option<usize>,
    pub buffered_samples: usize,
    pub retraining: bool,
}

/// Samples stamped with a group-wide order so buffers can be merged.
type Samples = Arc<Mutex<VecDeque<(u64, FeatureVector)>>>;

struct GroupSlot {
    current: ArcSwapOption<TrainedModel>,
    buffers: RwLock<HashMap<String, Samples>>,
    stamps: AtomicU64,
    running: AtomicBool,
    since_fit: AtomicU64,
    versions: AtomicU64,
}

impl GroupSlot {
    fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            buffers: RwLock::new(HashMap::new()),
            stamps: AtomicU64::new(0),
            running: AtomicBool::new(false),
            since_fit: AtomicU64::new(0),
            versions: AtomicU64::new(0),
        }
    }

    fn buffered(&self) -> Vec<Samples> {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// One sensor's training samples for its model group.
pub struct SampleBuffer {
    slot: Arc<GroupSlot>,
    samples: Samples,
    capacity: usize,
}

impl SampleBuffer {
    /// Remember a non-critical sample for future fits. Returns the number of
    /// samples recorded for the whole group since its last successful fit.
    pub fn record(&self, features: FeatureVector) -> u64 {
        let stamp = self.slot.stamps.fetch_add(1, Ordering::Relaxed);
        {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back((stamp, features));
        }
        self.slot.since_fit.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Held while a retrain runs for a group; releases the group on drop.
pub struct RetrainGuard {
    slot: Arc<GroupSlot>,
}

impl Drop for RetrainGuard {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::Release);
    }
}

pub struct ModelRegistry {
    groups: RwLock<HashMap<ModelGroup, Arc<GroupSlot>>>,
    snapshot_size: usize,
}

impl ModelRegistry {
    pub fn new(snapshot_size: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            snapshot_size: snapshot_size.max(1),
        }
    }

    fn existing(&self, group: &ModelGroup) -> Option<Arc<GroupSlot>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
            .cloned()
    }

    fn slot(&self, group: &ModelGroup) -> Arc<GroupSlot> {
        if let Some(slot) = self.existing(group) {
            return slot;
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(group.clone())
            .or_insert_with(|| Arc::new(GroupSlot::new()))
            .clone()
    }

    pub fn current(&self, group: &ModelGroup) -> Option<Arc<TrainedModel>> {
        self.existing(group)?.current.load_full()
    }

    /// Sample buffer for `sensor_id` within `group`, created on first use.
    /// Registering takes the group's write lock; recording never does.
    pub fn sample_buffer(&self, group: &ModelGroup, sensor_id: &str) -> SampleBuffer {
        let slot = self.slot(group);
        let samples = slot
            .buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sensor_id.to_string())
            .or_default()
            .clone();
        SampleBuffer {
            slot,
            samples,
            capacity: self.snapshot_size,
        }
    }

    /// Copy of the group's most recent `snapshot_size` samples across all of
    /// its sensors, oldest first.
    pub fn snapshot(&self, group: &ModelGroup) -> Vec<FeatureVector> {
        let Some(slot) = self.existing(group) else {
            return Vec::new();
        };
        let mut stamped: Vec<(u64, FeatureVector)> = Vec::new();
        for samples in slot.buffered() {
            let samples = samples.lock().unwrap_or_else(PoisonError::into_inner);
            stamped.extend(samples.iter().copied());
        }
        stamped.sort_unstable_by_key(|(stamp, _)| *stamp);
        let skip = stamped.len().saturating_sub(self.snapshot_size);
        stamped.into_iter().skip(skip).map(|(_, f)| f).collect()
    }

    /// Claim the group for a retrain. `None` if one is already running.
    pub fn try_begin(&self, group: &ModelGroup) -> Option<RetrainGuard> {
        let slot = self.slot(group);
        slot.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RetrainGuard { slot })
    }

    /// Atomically replace the group's model; returns the new version.
    pub fn install(&self, group: &ModelGroup, forest: IsolationForest, samples: usize) -> u64 {
        let slot = self.slot(group);
        let version = slot.versions.fetch_add(1, Ordering::AcqRel) + 1;
        slot.current.store(Some(Arc::new(TrainedModel {
            version,
            forest,
            trained_at: Utc::now(),
            samples,
        })));
        slot.since_fit.store(0, Ordering::Relaxed);
        version
    }

    pub fn groups(&self) -> Vec<ModelGroup> {
        let mut groups: Vec<ModelGroup> = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        groups.sort();
        groups
    }

    pub fn summaries(&self) -> Vec<ModelSummary> {
        self.groups()
            .into_iter()
            .filter_map(|group| {
                let slot = self.existing(&group)?;
                let current = slot.current.load_full();
                let buffered: usize = slot
                    .buffered()
                    .iter()
                    .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
                    .sum();
                let buffered_samples = buffered.min(self.snapshot_size);
                Some(ModelSummary {
                    version: current.as_ref().map(|m| m.version),
                    trained_at: current.as_ref().map(|m| m.trained_at),
                    trained_on: current.as_ref().map(|m| m.samples),
                    buffered_samples,
                    retraining: slot.running.load(Ordering::Acquire),
                    group,
                })
            })
            .collect()
    }
}

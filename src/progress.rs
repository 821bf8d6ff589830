//! Per-target progress aggregation.
//!
//! Workers report progress per stage; the aggregator turns each report into
//! a weighted overall percentage, keeps the latest record per target
//! (last writer wins) and emits one [`Event::Progress`] per accepted report.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::ProgressConfig;
use crate::error::Result;
use crate::types::{Event, ProgressRecord, Stage, TargetId};

#[derive(Default)]
struct ProgressState {
    records: HashMap<TargetId, ProgressRecord>,
    /// Targets whose job result is final; further updates are dropped
    finished: HashSet<TargetId>,
}

/// Consolidates worker progress and rebroadcasts it (cloneable, shared state)
#[derive(Clone)]
pub struct ProgressAggregator {
    weights: ProgressConfig,
    state: Arc<Mutex<ProgressState>>,
    event_tx: broadcast::Sender<Event>,
}

/// Overall percent: weights of fully completed earlier stages plus the
/// current stage's weighted share.
pub fn overall_percent(weights: &ProgressConfig, stage: Stage, stage_percent: f32) -> f32 {
    let completed: u32 = Stage::ALL
        .iter()
        .take_while(|s| **s != stage)
        .map(|s| weights.weight(*s))
        .sum();
    completed as f32 + weights.weight(stage) as f32 * clamp_percent(stage_percent) / 100.0
}

fn clamp_percent(percent: f32) -> f32 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

impl ProgressAggregator {
    /// Create an aggregator publishing to `event_tx`
    pub fn new(weights: ProgressConfig, event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            weights,
            state: Arc::new(Mutex::new(ProgressState::default())),
            event_tx,
        }
    }

    /// Apply a report whose stage is given by wire name.
    ///
    /// Unknown stage names are rejected with [`crate::Error::InvalidStage`].
    /// Returns `Ok(None)` when the target's stream is already closed.
    pub fn update(
        &self,
        target: &TargetId,
        stage: &str,
        sub_stage: &str,
        stage_percent: f32,
        message: &str,
    ) -> Result<Option<ProgressRecord>> {
        let stage: Stage = stage.parse().inspect_err(|e| {
            tracing::warn!(target = %target, error = %e, "Rejected progress update");
        })?;
        Ok(self.record(target, stage, sub_stage, stage_percent, message))
    }

    /// Apply a typed report. Returns `None` when the target's stream is closed.
    pub fn record(
        &self,
        target: &TargetId,
        stage: Stage,
        sub_stage: &str,
        stage_percent: f32,
        message: &str,
    ) -> Option<ProgressRecord> {
        let stage_percent = clamp_percent(stage_percent);
        let record = ProgressRecord {
            target_id: target.clone(),
            stage,
            sub_stage: sub_stage.to_string(),
            stage_percent,
            overall_percent: overall_percent(&self.weights, stage, stage_percent),
            message: message.to_string(),
            updated_at: Utc::now(),
        };

        {
            let mut state = self.lock();
            if state.finished.contains(target) {
                tracing::debug!(target = %target, stage = %stage, "Dropped progress for finished target");
                return None;
            }
            state.records.insert(target.clone(), record.clone());
        }

        self.event_tx
            .send(Event::Progress {
                record: record.clone(),
            })
            .ok();
        Some(record)
    }

    /// Latest record per target
    pub fn snapshot(&self) -> HashMap<TargetId, ProgressRecord> {
        self.lock().records.clone()
    }

    /// Latest record for one target
    pub fn get(&self, target: &TargetId) -> Option<ProgressRecord> {
        self.lock().records.get(target).cloned()
    }

    /// Close a target's stream: the last record stays, later updates are dropped
    pub fn finish(&self, target: &TargetId) {
        self.lock().finished.insert(target.clone());
    }

    /// Discard a target's record and reopen its stream
    pub fn reset(&self, target: &TargetId) {
        let mut state = self.lock();
        state.records.remove(target);
        state.finished.remove(target);
    }

    /// Discard everything
    pub fn clear(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.finished.clear();
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // Critical sections never panic mid-update, so a poisoned lock still holds consistent data
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

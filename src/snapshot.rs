use std::collections::BTreeMap;

use crate::config::SnapshotSpec;

/// The validation score of every finished epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationHistory {
    scores: BTreeMap<usize, f32>,
}

impl ValidationHistory {
    pub fn record(&mut self, epoch: usize, score: f32) {
        self.scores.insert(epoch, score);
    }

    pub fn get(&self, epoch: usize) -> Option<f32> {
        self.scores.get(&epoch).copied()
    }

    /// Returns the best score of every epoch except `epoch`.
    pub fn best_except(&self, epoch: usize) -> Option<f32> {
        self.scores
            .iter()
            .filter(|&(&e, _)| e != epoch)
            .map(|(_, &score)| score)
            .reduce(f32::max)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl FromIterator<(usize, f32)> for ValidationHistory {
    fn from_iter<I: IntoIterator<Item = (usize, f32)>>(iter: I) -> Self {
        Self {
            scores: iter.into_iter().collect(),
        }
    }
}

/// Decides which epochs get their hyper-gradients snapshotted.
///
/// Nothing before the warmup epoch is snapshotted and the warmup epoch always is. A
/// later epoch is only snapshotted when its score reaches the best score of every
/// other epoch plus the margin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotPolicy {
    warmup_epoch: usize,
    improvement_margin: f32,
}

impl SnapshotPolicy {
    pub fn new(spec: SnapshotSpec) -> Self {
        Self {
            warmup_epoch: spec.warmup_epoch,
            improvement_margin: spec.improvement_margin,
        }
    }

    /// # Returns
    /// Whether `epoch` must be snapshotted given the scores recorded so far. A late
    /// epoch without a recorded score is never snapshotted, one without any other
    /// epoch to compare to always is, and a score equal to the bound is.
    pub fn should_snapshot(&self, epoch: usize, history: &ValidationHistory) -> bool {
        if epoch < self.warmup_epoch {
            return false;
        }

        if epoch == self.warmup_epoch {
            return true;
        }

        let Some(current) = history.get(epoch) else {
            return false;
        };

        match history.best_except(epoch) {
            Some(best) => !(current < best + self.improvement_margin),
            None => true,
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::new(SnapshotSpec::default())
    }
}

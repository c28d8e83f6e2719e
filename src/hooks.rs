use std::path::Path;

use ndarray::Array1;

use crate::{
    HyperGradErr, Result, model::ModelCapability, recurrence::Coefficients,
    snapshot::ValidationHistory,
};

/// One parameter group of the trainer's optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamGroup {
    pub learning_rate: f32,
    /// Absent for an optimizer without a momentum term.
    pub momentum: Option<f32>,
}

/// The optimizer hyperparameters as seen right after a step.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub param_groups: Vec<ParamGroup>,
    pub weight_decay: f32,
}

impl OptimizerState {
    /// Reduces the optimizer to the coefficients of the step it just took.
    ///
    /// # Arguments
    /// * `learning_rates` - The scheduler's current rates, the group's own rate is
    ///   used when empty.
    ///
    /// # Returns
    /// The step's coefficients, or `UnsupportedOptimizerConfiguration` unless the
    /// optimizer has exactly one parameter group with momentum.
    pub fn coefficients(&self, learning_rates: &[f32]) -> Result<Coefficients> {
        let [group] = self.param_groups.as_slice() else {
            return Err(HyperGradErr::unsupported(format!(
                "expected exactly one parameter group, got {}",
                self.param_groups.len()
            )));
        };

        let momentum = group
            .momentum
            .ok_or_else(|| HyperGradErr::unsupported("the optimizer has no momentum"))?;

        let learning_rate = learning_rates.first().copied().unwrap_or(group.learning_rate);
        Ok(Coefficients::new(momentum, self.weight_decay, learning_rate))
    }
}

/// The arguments of `pre_batch`.
pub struct BatchStart<'a> {
    pub model: &'a dyn ModelCapability,
    /// The keys of the samples in the batch.
    pub indices: &'a [usize],
    pub batch_index: usize,
    pub learning_rates: &'a [f32],
}

/// The arguments of `after_batch`.
#[derive(Debug, Clone, Copy)]
pub struct BatchEnd<'a> {
    pub epoch: usize,
    pub batch_index: usize,
    pub batch_size: usize,
    pub loss: f32,
    pub learning_rates: &'a [f32],
    pub optimizer: &'a OptimizerState,
}

/// The parts of a trainer the hooks read back at epoch boundaries.
pub trait Checkpoint {
    /// Returns the validation score of every finished epoch.
    fn validation_history(&self) -> &ValidationHistory;

    /// Persists the trainer's model into `dir`.
    fn save(&self, dir: &Path) -> Result<()>;
}

/// The callbacks a trainer drives, in this order within one epoch: `pre_batch`, any
/// amount of `per_instance_gradient`, `after_batch` for every batch and finally
/// `after_epoch`.
pub trait TrainingHooks {
    fn pre_batch(&mut self, start: &BatchStart<'_>) -> Result<()>;

    fn per_instance_gradient(&mut self, instance_index: usize, gradient: Array1<f32>) -> Result<()>;

    fn after_batch(&mut self, end: &BatchEnd<'_>) -> Result<()>;

    fn after_epoch(
        &mut self,
        epoch: usize,
        learning_rates: &[f32],
        trainer: &dyn Checkpoint,
    ) -> Result<()>;
}

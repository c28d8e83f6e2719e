use ndarray::Array1;

use super::Coefficients;

/// Adds `alpha * x` to `acc`, where an absent operand stands for the zero vector.
///
/// Absent plus absent stays absent, so no zero vector is ever materialized.
pub(crate) fn add_scaled(
    acc: Option<Array1<f32>>,
    alpha: f32,
    x: Option<&Array1<f32>>,
) -> Option<Array1<f32>> {
    match (acc, x) {
        (acc, None) => acc,
        (None, Some(x)) => Some(x * alpha),
        (Some(mut acc), Some(x)) => {
            acc.scaled_add(alpha, x);
            Some(acc)
        }
    }
}

/// The recurrence state of one sample: its momentum term and its hyper-gradient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleState {
    pub momentum: Option<Array1<f32>>,
    pub hyper: Option<Array1<f32>>,
}

impl SampleState {
    /// Advances the state over a step where the sample had no gradient.
    pub fn advance(&mut self, c: Coefficients) {
        let momentum = self.momentum.take().map(|m| m * c.momentum);
        let momentum = add_scaled(momentum, c.weight_decay, self.hyper.as_ref());

        self.hyper = add_scaled(self.hyper.take(), -c.learning_rate, momentum.as_ref());
        self.momentum = momentum;
    }

    /// Advances the state over a step where the sample contributed `grad`.
    ///
    /// # Arguments
    /// * `grad` - The sample's gradient, already scaled to the training set size.
    /// * `c` - The step's coefficients.
    pub fn step(&mut self, grad: Array1<f32>, c: Coefficients) {
        let momentum = add_scaled(Some(grad), c.momentum, self.momentum.as_ref());
        let momentum = add_scaled(momentum, c.weight_decay, self.hyper.as_ref());

        self.hyper = add_scaled(self.hyper.take(), -c.learning_rate, momentum.as_ref());
        self.momentum = momentum;
    }
}

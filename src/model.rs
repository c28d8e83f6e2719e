use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// The phase a model is being run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Validation,
    Test,
}

/// What a model returns for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelOutput {
    pub loss: f32,
    /// Only reported outside of training, by models that expose raw predictions.
    pub prediction: Option<f32>,
}

/// The model behaviours the trainer depends on.
///
/// A model is a flat parameter vector interpreted by an implementation, the last
/// parameter is always the bias.
pub trait ModelCapability: Send + Sync {
    fn name(&self) -> &'static str;

    fn set_mode(&mut self, phase: Phase);

    fn phase(&self) -> Phase;

    /// Evaluates the loss of one sample under the current phase.
    fn compute_loss(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> ModelOutput;

    /// Returns the gradient of the sample's loss with respect to `params`.
    fn sample_gradient(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> Array1<f32>;

    /// Returns 1 for a sample the model gets right and 0 otherwise.
    fn score(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> f32;
}

/// Selects which `ModelCapability` implementation a run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Binary logistic regression.
    Classification,
    /// Smooth-L1 regression of a single box coordinate.
    Detection,
}

impl ModelKind {
    /// Builds the model once, every later call goes through the trait.
    pub fn build(self) -> Box<dyn ModelCapability> {
        match self {
            ModelKind::Classification => Box::new(Classifier::default()),
            ModelKind::Detection => Box::new(Detector::default()),
        }
    }

    /// Returns the label of a sample whose noiseless target is `signal`.
    pub fn label(self, signal: f32) -> f32 {
        match self {
            ModelKind::Classification => (signal > 0.) as u8 as f32,
            ModelKind::Detection => signal,
        }
    }
}

/// Returns `w · x + b` for the flat parameters `[w, b]`.
fn linear(params: &[f32], x: ArrayView1<f32>) -> f32 {
    let (bias, weights) = match params.split_last() {
        Some((bias, weights)) => (*bias, weights),
        None => return 0.,
    };

    ArrayView1::from(weights).dot(&x) + bias
}

/// Returns `scale * [x, 1]`, the gradient of a linear model's output times `scale`.
fn linear_gradient(x: ArrayView1<f32>, scale: f32) -> Array1<f32> {
    x.iter().map(|xi| xi * scale).chain([scale]).collect()
}

fn sigmoid(z: f32) -> f32 {
    1. / (1. + (-z).exp())
}

#[derive(Debug)]
pub struct Classifier {
    phase: Phase,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            phase: Phase::Training,
        }
    }
}

impl ModelCapability for Classifier {
    fn name(&self) -> &'static str {
        "classifier"
    }

    fn set_mode(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn compute_loss(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> ModelOutput {
        let p = sigmoid(linear(params, x)).clamp(f32::EPSILON, 1. - f32::EPSILON);

        ModelOutput {
            loss: -(y * p.ln() + (1. - y) * (1. - p).ln()),
            prediction: None,
        }
    }

    fn sample_gradient(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> Array1<f32> {
        linear_gradient(x, sigmoid(linear(params, x)) - y)
    }

    fn score(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> f32 {
        let predicted = (linear(params, x) >= 0.) as u8 as f32;
        (predicted == y) as u8 as f32
    }
}

/// Predictions within this distance of the target count as a hit.
const DETECTION_TOLERANCE: f32 = 0.5;

#[derive(Debug)]
pub struct Detector {
    phase: Phase,
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            phase: Phase::Training,
        }
    }
}

impl ModelCapability for Detector {
    fn name(&self) -> &'static str {
        "detector"
    }

    fn set_mode(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn compute_loss(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> ModelOutput {
        let prediction = linear(params, x);
        let r = (prediction - y).abs();
        let loss = if r < 1. { 0.5 * r * r } else { r - 0.5 };

        ModelOutput {
            loss,
            prediction: (self.phase != Phase::Training).then_some(prediction),
        }
    }

    fn sample_gradient(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> Array1<f32> {
        linear_gradient(x, (linear(params, x) - y).clamp(-1., 1.))
    }

    fn score(&self, params: &[f32], x: ArrayView1<f32>, y: f32) -> f32 {
        ((linear(params, x) - y).abs() < DETECTION_TOLERANCE) as u8 as f32
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_classifier_gradient_matches_finite_difference() {
        let model = ModelKind::Classification.build();
        let params = [0.3, -0.2, 0.1];
        let x = array![1., 2.];
        let grad = model.sample_gradient(&params, x.view(), 1.);

        let h = 1e-3;
        for i in 0..params.len() {
            let mut up = params;
            let mut down = params;
            up[i] += h;
            down[i] -= h;

            let numeric = (model.compute_loss(&up, x.view(), 1.).loss
                - model.compute_loss(&down, x.view(), 1.).loss)
                / (2. * h);
            assert!((numeric - grad[i]).abs() < 1e-2, "coordinate {i}");
        }
    }

    #[test]
    fn test_detector_reports_predictions_outside_training() {
        let mut model = ModelKind::Detection.build();
        let params = [1., 0.];
        let x = array![2.];

        assert_eq!(model.compute_loss(&params, x.view(), 2.).prediction, None);

        model.set_mode(Phase::Validation);
        let output = model.compute_loss(&params, x.view(), 5.);
        assert_eq!(output.prediction, Some(2.));
        assert_eq!(output.loss, 2.5);
    }

    #[test]
    fn test_detector_gradient_is_clipped() {
        let model = ModelKind::Detection.build();
        let grad = model.sample_gradient(&[1., 0.], array![2.].view(), -10.);

        assert_eq!(grad, array![2., 1.]);
    }

    #[test]
    fn test_scores() {
        let classifier = ModelKind::Classification.build();
        assert_eq!(classifier.score(&[1., 0.], array![1.].view(), 1.), 1.);
        assert_eq!(classifier.score(&[1., 0.], array![-1.].view(), 1.), 0.);

        let detector = ModelKind::Detection.build();
        assert_eq!(detector.score(&[1., 0.], array![1.].view(), 1.2), 1.);
        assert_eq!(detector.score(&[1., 0.], array![1.].view(), 2.), 0.);
    }
}

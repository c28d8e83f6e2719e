use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use device_pool::{Device, DeviceWorkerPool};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1};
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use rand_distr::StandardNormal;
use serde::Serialize;

use crate::{
    HyperGradErr, Result,
    config::SyntheticSpec,
    context::RunContext,
    hooks::{BatchEnd, BatchStart, Checkpoint, OptimizerState, ParamGroup, TrainingHooks},
    model::{ModelCapability, ModelKind, Phase},
    snapshot::ValidationHistory,
};

const CHECKPOINT_FILE: &str = "model.json";

const TRUTH_STREAM: u64 = 1;
const TRAINING_STREAM: u64 = 2;
const VALIDATION_STREAM: u64 = 3;
const PRUNING_STREAM: u64 = 4;

/// Samples with a row of features and one label each.
#[derive(Debug, Clone)]
pub struct Dataset {
    x: Array2<f32>,
    y: Array1<f32>,
}

impl Dataset {
    /// Generates `samples` uniform feature rows labelled by a noisy linear target.
    ///
    /// Classification labels are flipped with probability `label_noise`, detection
    /// targets get gaussian noise of that standard deviation.
    fn generate(
        kind: ModelKind,
        truth: &[f32],
        samples: usize,
        label_noise: f32,
        rng: &mut StdRng,
    ) -> Self {
        let features = truth.len() - 1;
        let x = Array2::from_shape_fn((samples, features), |_| rng.random_range(-1f32..1.));
        let noise = label_noise.clamp(0., 1.);

        let y = x
            .rows()
            .into_iter()
            .map(|row| {
                let signal = ArrayView1::from(&truth[..features]).dot(&row) + truth[features];
                let label = kind.label(signal);

                match kind {
                    ModelKind::Classification if noise > 0. => {
                        if rng.random_bool(noise as f64) { 1. - label } else { label }
                    }
                    ModelKind::Classification => label,
                    ModelKind::Detection => label + noise * rng.sample::<f32, _>(StandardNormal),
                }
            })
            .collect();

        Self { x, y }
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn sample(&self, index: usize) -> (ArrayView1<'_, f32>, f32) {
        (self.x.row(index), self.y[index])
    }
}

/// A chunk of one batch, computed on a single device.
struct GradientTask {
    params: Arc<[f32]>,
    samples: Vec<(usize, Vec<f32>, f32)>,
}

type SampleGradients = Vec<(usize, Array1<f32>)>;

fn gradient_worker(
    kind: ModelKind,
) -> impl Fn(GradientTask, Device) -> std::result::Result<SampleGradients, String> + Send + Sync + 'static
{
    let model = kind.build();

    move |task, device| {
        debug!(samples = task.samples.len(); "computing sample gradients on {device}");

        let gradients = task
            .samples
            .into_iter()
            .map(|(index, x, y)| {
                let gradient = model.sample_gradient(&task.params, ArrayView1::from(&x[..]), y);
                (index, gradient)
            })
            .collect();

        Ok(gradients)
    }
}

#[derive(Serialize)]
struct ModelCheckpoint<'a> {
    model: ModelKind,
    params: &'a [f32],
    validation_scores: Vec<(usize, f32)>,
}

/// A linear model trained with momentum SGD over generated data.
///
/// Per-sample gradients of every batch are spread over a `DeviceWorkerPool`, the
/// trainer drives the `TrainingHooks` around each step.
pub struct SyntheticTrainer {
    spec: SyntheticSpec,
    model: Box<dyn ModelCapability>,
    params: Vec<f32>,
    velocity: Vec<f32>,
    mask: Option<Vec<bool>>,
    training: Dataset,
    validation: Dataset,
    pool: DeviceWorkerPool<GradientTask, SampleGradients>,
    history: ValidationHistory,
    epochs_done: Vec<usize>,
    rng: StdRng,
}

impl SyntheticTrainer {
    /// Creates a new `SyntheticTrainer` and starts its device pool.
    ///
    /// # Arguments
    /// * `spec` - The model, data and optimizer settings.
    /// * `devices` - The devices the per-sample gradients are computed on.
    /// * `context` - Seeds the generated data and the batch order.
    pub fn new(spec: SyntheticSpec, devices: Vec<Device>, context: &RunContext) -> Result<Self> {
        let features = spec.features.get();
        let parameter_count = features + 1;

        let mut truth_rng = context.rng_for(TRUTH_STREAM);
        let truth: Vec<f32> = (0..parameter_count)
            .map(|_| truth_rng.random_range(-2f32..2.))
            .collect();

        let training = Dataset::generate(
            spec.model,
            &truth,
            spec.samples.get(),
            spec.label_noise,
            &mut context.rng_for(TRAINING_STREAM),
        );
        let validation = Dataset::generate(
            spec.model,
            &truth,
            spec.validation_samples.get(),
            spec.label_noise,
            &mut context.rng_for(VALIDATION_STREAM),
        );

        let mask = prune_mask(features, spec.pruning, &mut context.rng_for(PRUNING_STREAM));

        let mut pool = DeviceWorkerPool::new(gradient_worker(spec.model), devices)?;
        pool.start()?;

        let model = spec.model.build();
        info!(
            parameter_count = parameter_count,
            samples = training.len(),
            workers = pool.workers();
            "begin training {}",
            model.name()
        );

        Ok(Self {
            model,
            params: vec![0.; parameter_count],
            velocity: vec![0.; parameter_count],
            mask,
            training,
            validation,
            pool,
            history: ValidationHistory::default(),
            epochs_done: Vec::new(),
            rng: context.enable(),
            spec,
        })
    }

    pub fn model(&self) -> &dyn ModelCapability {
        self.model.as_ref()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    pub fn training_set_size(&self) -> usize {
        self.training.len()
    }

    /// Returns the coordinates that survived pruning, if the model was pruned.
    pub fn mask(&self) -> Option<&[bool]> {
        self.mask.as_deref()
    }

    /// Returns the optimizer as exposed to the hooks.
    pub fn optimizer_state(&self) -> OptimizerState {
        OptimizerState {
            param_groups: vec![ParamGroup {
                learning_rate: self.spec.learning_rate,
                momentum: self.spec.momentum,
            }],
            weight_decay: self.spec.weight_decay,
        }
    }

    /// Runs every epoch, or until `stop` is raised.
    ///
    /// # Returns
    /// The amount of finished epochs.
    pub fn train(&mut self, hooks: &mut dyn TrainingHooks, stop: &AtomicBool) -> Result<usize> {
        let batch_size = self.spec.batch_size.get();
        let learning_rates = [self.spec.learning_rate];
        let log_every = self.training.len() / (10 * batch_size);

        for epoch in 1..=self.spec.epochs {
            self.model.set_mode(Phase::Training);

            let mut order: Vec<usize> = (0..self.training.len()).collect();
            order.shuffle(&mut self.rng);

            let mut epoch_loss = 0.;
            for (batch_index, batch) in order.chunks(batch_size).enumerate() {
                if stop.load(Ordering::Relaxed) {
                    info!(epoch = epoch, batch = batch_index; "training interrupted");
                    return Ok(self.epochs_done.len());
                }

                hooks.pre_batch(&BatchStart {
                    model: self.model.as_ref(),
                    indices: batch,
                    batch_index,
                    learning_rates: &learning_rates,
                })?;

                let loss = self.step(batch, hooks)?;
                epoch_loss += loss * batch.len() as f32;

                hooks.after_batch(&BatchEnd {
                    epoch,
                    batch_index,
                    batch_size: batch.len(),
                    loss,
                    learning_rates: &learning_rates,
                    optimizer: &self.optimizer_state(),
                })?;

                if log_every == 0 || batch_index % log_every == 0 {
                    info!(
                        epoch = epoch,
                        batch = batch_index,
                        learning_rate = self.spec.learning_rate,
                        loss = loss;
                        "batch trained"
                    );
                }
            }

            let training_loss = epoch_loss / self.training.len() as f32;
            let (validation_loss, accuracy) = self.validate();
            self.history.record(epoch, accuracy);
            self.epochs_done.push(epoch);

            info!(
                epoch = epoch,
                training_loss = training_loss,
                validation_loss = validation_loss,
                accuracy = accuracy;
                "epoch finished"
            );

            hooks.after_epoch(epoch, &learning_rates, &*self)?;
        }

        Ok(self.epochs_done.len())
    }

    /// Computes the batch's per-sample gradients on the pool, forwards them to the
    /// hooks and takes one momentum SGD step.
    ///
    /// # Returns
    /// The mean loss of the batch before the step.
    fn step(&mut self, batch: &[usize], hooks: &mut dyn TrainingHooks) -> Result<f32> {
        let params: Arc<[f32]> = Arc::from(self.params.as_slice());
        let chunk_size = batch.len().div_ceil(self.pool.workers());

        for chunk in batch.chunks(chunk_size) {
            let samples = chunk
                .iter()
                .map(|&index| {
                    let (x, y) = self.training.sample(index);
                    (index, x.to_vec(), y)
                })
                .collect();

            self.pool.add_task(GradientTask {
                params: Arc::clone(&params),
                samples,
            })?;
        }

        let mut mean = Array1::<f32>::zeros(self.params.len());
        let scale = 1. / batch.len() as f32;

        for outcome in self.pool.drain_results() {
            for (index, gradient) in outcome.result? {
                mean.scaled_add(scale, &gradient);
                hooks.per_instance_gradient(index, gradient)?;
            }
        }

        let loss = batch
            .iter()
            .map(|&index| {
                let (x, y) = self.training.sample(index);
                self.model.compute_loss(&self.params, x, y).loss
            })
            .sum::<f32>()
            * scale;

        self.apply(mean);
        Ok(loss)
    }

    /// `v = momentum * v + g + weight_decay * p`, `p -= learning_rate * v`.
    fn apply(&mut self, gradient: Array1<f32>) {
        let momentum = self.spec.momentum.unwrap_or_default();
        let weight_decay = self.spec.weight_decay;
        let learning_rate = self.spec.learning_rate;

        for (i, g) in gradient.iter().enumerate() {
            let pruned = self.mask.as_ref().is_some_and(|mask| !mask[i]);
            if pruned {
                continue;
            }

            self.velocity[i] = momentum * self.velocity[i] + g + weight_decay * self.params[i];
            self.params[i] -= learning_rate * self.velocity[i];
        }
    }

    /// # Returns
    /// The mean validation loss and the validation accuracy.
    fn validate(&mut self) -> (f32, f32) {
        self.model.set_mode(Phase::Validation);

        let (loss, hits) = (0..self.validation.len())
            .map(|index| {
                let (x, y) = self.validation.sample(index);
                let output = self.model.compute_loss(&self.params, x, y);
                (output.loss, self.model.score(&self.params, x, y))
            })
            .fold((0., 0.), |(loss, hits), (l, h)| (loss + l, hits + h));

        let n = self.validation.len() as f32;
        (loss / n, hits / n)
    }

    /// Returns the mean gradient of the validation loss at the current parameters.
    pub fn validation_gradient(&self) -> Array1<f32> {
        let mut mean = Array1::<f32>::zeros(self.params.len());
        let scale = 1. / self.validation.len() as f32;

        for index in 0..self.validation.len() {
            let (x, y) = self.validation.sample(index);
            mean.scaled_add(scale, &self.model.sample_gradient(&self.params, x, y));
        }
        mean
    }

    /// Stops the device pool.
    pub fn shutdown(&mut self) -> Result<()> {
        self.pool.stop()?;
        Ok(())
    }
}

impl Checkpoint for SyntheticTrainer {
    fn validation_history(&self) -> &ValidationHistory {
        &self.history
    }

    fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(HyperGradErr::io(dir))?;

        let checkpoint = ModelCheckpoint {
            model: self.spec.model,
            params: &self.params,
            validation_scores: self
                .epochs_done
                .iter()
                .filter_map(|&epoch| self.history.get(epoch).map(|score| (epoch, score)))
                .collect(),
        };

        let path = dir.join(CHECKPOINT_FILE);
        let bytes = serde_json::to_vec_pretty(&checkpoint).map_err(|source| HyperGradErr::Config {
            path: path.clone(),
            source,
        })?;

        fs::write(&path, bytes).map_err(HyperGradErr::io(&path))?;
        info!("saved model to {}", path.display());
        Ok(())
    }
}

/// Prunes `fraction` of the weights, the bias always survives.
fn prune_mask(features: usize, fraction: f32, rng: &mut StdRng) -> Option<Vec<bool>> {
    let pruned = ((features as f32) * fraction.clamp(0., 1.)) as usize;
    if pruned == 0 {
        return None;
    }

    let mut mask = vec![true; features + 1];
    let mut weights: Vec<usize> = (0..features).collect();
    weights.shuffle(rng);

    for &i in &weights[..pruned] {
        mask[i] = false;
    }
    Some(mask)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    fn spec() -> SyntheticSpec {
        SyntheticSpec {
            samples: NonZeroUsize::new(64).unwrap(),
            validation_samples: NonZeroUsize::new(64).unwrap(),
            features: NonZeroUsize::new(4).unwrap(),
            batch_size: NonZeroUsize::new(8).unwrap(),
            epochs: 3,
            label_noise: 0.,
            ..SyntheticSpec::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        gradients: usize,
    }

    impl TrainingHooks for Recorder {
        fn pre_batch(&mut self, start: &BatchStart<'_>) -> Result<()> {
            self.calls.push(format!("pre {}", start.batch_index));
            Ok(())
        }

        fn per_instance_gradient(&mut self, _: usize, gradient: Array1<f32>) -> Result<()> {
            assert_eq!(gradient.len(), 5);
            self.gradients += 1;
            Ok(())
        }

        fn after_batch(&mut self, end: &BatchEnd<'_>) -> Result<()> {
            self.calls.push(format!("after {}", end.batch_index));
            Ok(())
        }

        fn after_epoch(&mut self, epoch: usize, _: &[f32], trainer: &dyn Checkpoint) -> Result<()> {
            assert!(trainer.validation_history().get(epoch).is_some());
            self.calls.push(format!("epoch {epoch}"));
            Ok(())
        }
    }

    #[test]
    fn test_hooks_are_called_in_order() {
        let context = RunContext::new(Some(5));
        let mut trainer =
            SyntheticTrainer::new(spec(), vec![Device::Cpu, Device::Cuda(0)], &context).unwrap();
        let mut recorder = Recorder::default();

        let epochs = trainer.train(&mut recorder, &AtomicBool::new(false)).unwrap();
        trainer.shutdown().unwrap();

        assert_eq!(epochs, 3);
        assert_eq!(recorder.gradients, 3 * 64);
        assert_eq!(recorder.calls.len(), 3 * (2 * 8 + 1));
        assert_eq!(recorder.calls[..3], ["pre 0", "after 0", "pre 1"]);
        assert_eq!(recorder.calls[16], "epoch 1");
    }

    #[test]
    fn test_classifier_learns_separable_data() {
        let context = RunContext::new(Some(9));
        let spec = SyntheticSpec {
            epochs: 10,
            ..spec()
        };
        let mut trainer = SyntheticTrainer::new(spec, vec![Device::Cpu], &context).unwrap();

        trainer.train(&mut Recorder::default(), &AtomicBool::new(false)).unwrap();
        let accuracy = trainer.validation_history().get(10).unwrap();
        trainer.shutdown().unwrap();

        assert!(accuracy > 0.7, "accuracy {accuracy}");
    }

    #[test]
    fn test_pruned_weights_stay_zero() {
        let context = RunContext::new(Some(2));
        let spec = SyntheticSpec {
            pruning: 0.5,
            ..spec()
        };
        let mut trainer = SyntheticTrainer::new(spec, vec![Device::Cpu], &context).unwrap();
        let mask = trainer.mask().unwrap().to_vec();

        assert_eq!(mask.iter().filter(|kept| !**kept).count(), 2);
        assert!(mask[4]);

        trainer.train(&mut Recorder::default(), &AtomicBool::new(false)).unwrap();
        trainer.shutdown().unwrap();

        for (param, kept) in trainer.params().iter().zip(mask) {
            if !kept {
                assert_eq!(*param, 0.);
            }
        }
    }

    #[test]
    fn test_stop_flag_interrupts_training() {
        let context = RunContext::new(Some(1));
        let mut trainer = SyntheticTrainer::new(spec(), vec![Device::Cpu], &context).unwrap();

        let epochs = trainer.train(&mut Recorder::default(), &AtomicBool::new(true)).unwrap();
        trainer.shutdown().unwrap();

        assert_eq!(epochs, 0);
    }
}

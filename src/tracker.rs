use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::{debug, info};
use ndarray::Array1;
use vector_store::{Layout, StoreErr, VectorStore};

use crate::{
    HyperGradErr, Result,
    config::TrackerSpec,
    context::RunContext,
    hooks::{BatchEnd, BatchStart, Checkpoint, TrainingHooks},
    recurrence::LazyRecurrence,
    snapshot::SnapshotPolicy,
};

const HYPER_DIR: &str = "hyper_gradient_matrix";
const MOMENTUM_DIR: &str = "mom_gradient_matrix";

/// Tracks the hyper-gradient of every training sample through the training hooks.
pub struct HyperGradientTracker {
    engine: LazyRecurrence,
    policy: SnapshotPolicy,
    save_dir: PathBuf,
    batch_gradients: BTreeMap<usize, Array1<f32>>,
}

impl HyperGradientTracker {
    /// Creates a new `HyperGradientTracker` with fresh stores for this run.
    ///
    /// # Arguments
    /// * `spec` - Where to save and how to size the stores.
    /// * `context` - The run, its id names both store directories.
    /// * `training_set_size` - The amount of tracked samples.
    /// * `parameter_count` - The length of every tracked vector.
    /// * `mask` - For a pruned model, the coordinates that survived pruning.
    pub fn new(
        spec: &TrackerSpec,
        context: &RunContext,
        training_set_size: usize,
        parameter_count: usize,
        mask: Option<&[bool]>,
    ) -> Result<Self> {
        let layout = match mask {
            Some(mask) => {
                let layout = Layout::masked(mask, parameter_count)?;
                let kept = layout.stored_len();
                let sparsity = 100. * (parameter_count - kept) as f32 / parameter_count.max(1) as f32;

                info!(sparsity = sparsity; "use pruned model");
                info!(
                    none_zero_parameter_num = kept,
                    parameter_count = parameter_count;
                    "pruned model parameters"
                );
                layout
            }
            None => {
                info!(parameter_count = parameter_count; "use unpruned model");
                Layout::dense(parameter_count)
            }
        };

        let run_id = context.run_id.to_string();
        let hyper_dir = spec.save_dir.join(HYPER_DIR).join(&run_id);
        let momentum_dir = spec.save_dir.join(MOMENTUM_DIR).join(&run_id);

        let hyper = VectorStore::open(hyper_dir, layout.clone(), &spec.store)?;
        let momentum = VectorStore::open(momentum_dir, layout, &spec.store)?;

        Ok(Self {
            engine: LazyRecurrence::new(momentum, hyper, training_set_size)?,
            policy: SnapshotPolicy::new(spec.snapshot),
            save_dir: spec.save_dir.clone(),
            batch_gradients: BTreeMap::new(),
        })
    }

    pub fn engine(&self) -> &LazyRecurrence {
        &self.engine
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn hyper_dir(&self) -> &Path {
        self.engine.hyper_store().dir()
    }

    pub fn momentum_dir(&self) -> &Path {
        self.engine.momentum_store().dir()
    }

    /// Catches every sample up, saves the trainer and makes the hyper-gradients
    /// durable before releasing both stores.
    pub fn finish(&mut self, trainer: &dyn Checkpoint) -> Result<()> {
        info!("begin final drain");
        self.engine.drain_all()?;
        info!("end final drain");

        trainer.save(&self.save_dir)?;
        self.engine.finish()
    }

    fn check_gradient(&self, gradient: &Array1<f32>) -> Result<()> {
        if gradient.len() != self.engine.dim() {
            return Err(StoreErr::ShapeMismatch {
                what: "instance gradient",
                got: gradient.len(),
                expected: self.engine.dim(),
            }
            .into());
        }
        Ok(())
    }
}

impl TrainingHooks for HyperGradientTracker {
    fn pre_batch(&mut self, start: &BatchStart<'_>) -> Result<()> {
        debug!(batch = start.batch_index, model = start.model.name(); "pre batch");

        self.engine.prefetch(start.indices);
        self.batch_gradients.clear();
        Ok(())
    }

    fn per_instance_gradient(&mut self, instance_index: usize, gradient: Array1<f32>) -> Result<()> {
        if instance_index >= self.engine.keys() {
            return Err(HyperGradErr::KeyOutOfRange {
                key: instance_index,
                keys: self.engine.keys(),
            });
        }

        self.batch_gradients.insert(instance_index, gradient);
        Ok(())
    }

    /// Queues the step for every sample outside the batch and applies it directly to
    /// the ones inside. Every argument is validated before any state changes.
    fn after_batch(&mut self, end: &BatchEnd<'_>) -> Result<()> {
        let coefficients = end.optimizer.coefficients(end.learning_rates)?;
        let empty = || HyperGradErr::EmptyBatch {
            batch_index: end.batch_index,
        };
        let batch_size = NonZeroUsize::new(end.batch_size).ok_or_else(empty)?;
        if self.batch_gradients.is_empty() {
            return Err(empty());
        }

        for gradient in self.batch_gradients.values() {
            self.check_gradient(gradient)?;
        }

        let mut touched = vec![false; self.engine.keys()];
        for &key in self.batch_gradients.keys() {
            touched[key] = true;
        }

        self.engine.enqueue_untouched(&touched, coefficients)?;

        let gradients = std::mem::take(&mut self.batch_gradients);
        for (key, gradient) in gradients {
            match gradient.as_slice() {
                Some(slice) => self.engine.direct_update(key, slice, batch_size, coefficients)?,
                None => {
                    let owned = gradient.to_vec();
                    self.engine.direct_update(key, &owned, batch_size, coefficients)?
                }
            }
        }

        Ok(())
    }

    fn after_epoch(
        &mut self,
        epoch: usize,
        learning_rates: &[f32],
        trainer: &dyn Checkpoint,
    ) -> Result<()> {
        if !self.policy.should_snapshot(epoch, trainer.validation_history()) {
            return Ok(());
        }

        let learning_rate = learning_rates.first().copied().unwrap_or_default();
        info!(epoch = epoch, learning_rate = learning_rate; "snapshotting epoch");
        let (momentum, hyper) = self.engine.snapshot(epoch)?;
        debug!("momentum snapshot at {}", momentum.display());
        debug!("hyper-gradient snapshot at {}", hyper.display());

        trainer.save(&self.save_dir.join(format!("epoch_{epoch}")))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        hooks::{OptimizerState, ParamGroup},
        model::ModelKind,
        snapshot::ValidationHistory,
    };

    #[derive(Default)]
    struct FakeTrainer {
        history: ValidationHistory,
        saves: RefCell<Vec<PathBuf>>,
    }

    impl Checkpoint for FakeTrainer {
        fn validation_history(&self) -> &ValidationHistory {
            &self.history
        }

        fn save(&self, dir: &Path) -> Result<()> {
            self.saves.borrow_mut().push(dir.to_path_buf());
            Ok(())
        }
    }

    fn spec(save_dir: &Path) -> TrackerSpec {
        TrackerSpec {
            save_dir: save_dir.to_path_buf(),
            ..TrackerSpec::default()
        }
    }

    fn optimizer(momentum: Option<f32>) -> OptimizerState {
        OptimizerState {
            param_groups: vec![ParamGroup {
                learning_rate: 0.1,
                momentum,
            }],
            weight_decay: 0.,
        }
    }

    fn end<'a>(optimizer: &'a OptimizerState, batch_size: usize) -> BatchEnd<'a> {
        BatchEnd {
            epoch: 1,
            batch_index: 0,
            batch_size,
            loss: 0.,
            learning_rates: &[],
            optimizer,
        }
    }

    #[test]
    fn test_store_dirs_are_tagged_with_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let context = RunContext::new(Some(0));
        let tracker = HyperGradientTracker::new(&spec(dir.path()), &context, 4, 3, None).unwrap();

        let run_id = context.run_id.to_string();
        assert_eq!(tracker.hyper_dir(), dir.path().join(HYPER_DIR).join(&run_id));
        assert_eq!(tracker.momentum_dir(), dir.path().join(MOMENTUM_DIR).join(&run_id));
    }

    #[test]
    fn test_mask_of_wrong_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let context = RunContext::new(Some(0));

        let tracker = HyperGradientTracker::new(&spec(dir.path()), &context, 4, 3, Some(&[true]));
        assert!(matches!(
            tracker,
            Err(HyperGradErr::Store(StoreErr::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn test_batch_updates_touched_and_queues_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let context = RunContext::new(Some(0));
        let mut tracker = HyperGradientTracker::new(&spec(dir.path()), &context, 3, 2, None).unwrap();
        let model = ModelKind::Classification.build();
        let optimizer = optimizer(Some(0.9));

        tracker
            .pre_batch(&BatchStart {
                model: model.as_ref(),
                indices: &[1],
                batch_index: 0,
                learning_rates: &[],
            })
            .unwrap();
        tracker.per_instance_gradient(1, ndarray::array![1., 2.]).unwrap();
        tracker.after_batch(&end(&optimizer, 1)).unwrap();

        let engine = tracker.engine();
        assert!(engine.hyper_store().contains(1));
        assert!(engine.pending(1).unwrap().is_empty());
        assert_eq!(engine.pending(0).unwrap().len(), 1);
        assert_eq!(engine.pending(2).unwrap().len(), 1);
    }

    #[test]
    fn test_bad_batches_abort_before_any_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let context = RunContext::new(Some(0));
        let mut tracker = HyperGradientTracker::new(&spec(dir.path()), &context, 2, 2, None).unwrap();

        tracker.per_instance_gradient(0, ndarray::array![1., 2.]).unwrap();
        let plain_sgd = optimizer(None);
        assert!(matches!(
            tracker.after_batch(&end(&plain_sgd, 1)),
            Err(HyperGradErr::UnsupportedOptimizerConfiguration { .. })
        ));

        tracker.per_instance_gradient(1, ndarray::array![1.]).unwrap();
        let momentum = optimizer(Some(0.9));
        assert!(matches!(
            tracker.after_batch(&end(&momentum, 2)),
            Err(HyperGradErr::Store(StoreErr::ShapeMismatch { .. }))
        ));
        let fresh_spec = spec(&dir.path().join("fresh"));
        let mut fresh = HyperGradientTracker::new(&fresh_spec, &context, 2, 2, None).unwrap();
        assert!(matches!(
            fresh.after_batch(&end(&momentum, 1)),
            Err(HyperGradErr::EmptyBatch { batch_index: 0 })
        ));
        assert!(fresh.engine().pending(0).unwrap().is_empty());

        assert!(matches!(
            tracker.per_instance_gradient(2, ndarray::array![1., 2.]),
            Err(HyperGradErr::KeyOutOfRange { .. })
        ));

        let engine = tracker.engine();
        assert!(!engine.hyper_store().contains(0));
        assert!(engine.pending(0).unwrap().is_empty());
        assert!(engine.pending(1).unwrap().is_empty());
    }

    #[test]
    fn test_after_epoch_follows_the_policy() {
        let dir = tempfile::tempdir().unwrap();
        let context = RunContext::new(Some(0));
        let mut tracker = HyperGradientTracker::new(&spec(dir.path()), &context, 2, 1, None).unwrap();
        let trainer = FakeTrainer::default();

        tracker.after_epoch(9, &[0.1], &trainer).unwrap();
        assert!(trainer.saves.borrow().is_empty());

        tracker.after_epoch(10, &[0.1], &trainer).unwrap();
        assert_eq!(*trainer.saves.borrow(), vec![dir.path().join("epoch_10")]);

        let mut hyper = tracker.hyper_dir().as_os_str().to_os_string();
        hyper.push("_epoch_10");
        assert!(PathBuf::from(hyper).is_dir());
    }
}

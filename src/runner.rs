use std::{path::PathBuf, sync::atomic::AtomicBool};

use log::{info, warn};
use uuid::Uuid;
use vector_store::Key;

use crate::{
    Result,
    config::{RunSpec, TrackerSpec},
    context::RunContext,
    influence,
    tracker::HyperGradientTracker,
    trainer::SyntheticTrainer,
};

/// The amount of most and least helpful samples reported at the end of a run.
const REPORTED_SAMPLES: usize = 5;

/// What a finished run left behind.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub epochs: usize,
    pub hyper_dir: PathBuf,
    /// Every sample's hyper-gradient scored against the validation gradient, in
    /// ascending order.
    pub contributions: Vec<(Key, f32)>,
}

/// Trains the synthetic model while tracking the hyper-gradient of every sample.
///
/// # Arguments
/// * `spec` - The whole run's configuration.
/// * `stop` - Ends training early once raised, the run is still finished cleanly.
pub fn run(spec: RunSpec, stop: &AtomicBool) -> Result<RunSummary> {
    let context = RunContext::new(spec.seed);
    context.save(&spec.tracker.save_dir)?;

    let mut trainer = SyntheticTrainer::new(spec.trainer, spec.tracker.devices(), &context)?;
    let outcome = track(&spec.tracker, &context, &mut trainer, stop);

    if let Err(e) = trainer.shutdown() {
        warn!("failed to stop the device pool: {e}");
    }

    outcome
}

fn track(
    spec: &TrackerSpec,
    context: &RunContext,
    trainer: &mut SyntheticTrainer,
    stop: &AtomicBool,
) -> Result<RunSummary> {
    let mut tracker = HyperGradientTracker::new(
        spec,
        context,
        trainer.training_set_size(),
        trainer.parameter_count(),
        trainer.mask(),
    )?;

    info!("begin train");
    let epochs = trainer.train(&mut tracker, stop)?;
    tracker.finish(&*trainer)?;

    let product = trainer.validation_gradient() / trainer.training_set_size() as f32;
    let product = product.to_vec();
    let mut contributions: Vec<(Key, f32)> =
        influence::contributions(tracker.engine().hyper_store(), &product)?
            .into_iter()
            .collect();
    contributions.sort_by(|a, b| a.1.total_cmp(&b.1));

    for (key, score) in contributions.iter().take(REPORTED_SAMPLES) {
        info!(key = *key, score = *score; "most helpful sample");
    }
    for (key, score) in contributions.iter().rev().take(REPORTED_SAMPLES) {
        info!(key = *key, score = *score; "most harmful sample");
    }

    Ok(RunSummary {
        run_id: context.run_id,
        epochs,
        hyper_dir: tracker.hyper_dir().to_path_buf(),
        contributions,
    })
}

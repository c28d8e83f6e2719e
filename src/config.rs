use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use device_pool::Device;
use serde::{Deserialize, Serialize};
use vector_store::StoreConfig;

use crate::{HyperGradErr, Result, model::ModelKind};

const DEFAULT_SAVE_DIR: &str = "hyper_gradient_run";

/// The configuration of the `SnapshotPolicy`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSpec {
    /// The first epoch that is snapshotted, always.
    pub warmup_epoch: usize,
    /// How much a later epoch must beat every other epoch by to skip its snapshot.
    pub improvement_margin: f32,
}

impl Default for SnapshotSpec {
    fn default() -> Self {
        Self {
            warmup_epoch: 10,
            improvement_margin: 0.01,
        }
    }
}

/// The configuration of the `HyperGradientTracker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSpec {
    /// The run root, store directories and trainer checkpoints live under it.
    pub save_dir: PathBuf,
    pub store: StoreConfig,
    pub snapshot: SnapshotSpec,
    /// The devices per-sample gradients run on, discovered when absent.
    pub devices: Option<Vec<Device>>,
}

impl TrackerSpec {
    /// Returns the configured devices, or the ones visible to this process.
    pub fn devices(&self) -> Vec<Device> {
        match &self.devices {
            Some(devices) if !devices.is_empty() => devices.clone(),
            _ => Device::discover(),
        }
    }
}

impl Default for TrackerSpec {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from(DEFAULT_SAVE_DIR),
            store: StoreConfig::default(),
            snapshot: SnapshotSpec::default(),
            devices: None,
        }
    }
}

/// The configuration of the `SyntheticTrainer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSpec {
    pub model: ModelKind,
    pub samples: NonZeroUsize,
    pub validation_samples: NonZeroUsize,
    pub features: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub epochs: usize,
    pub learning_rate: f32,
    /// Plain SGD when absent, which the tracker refuses.
    pub momentum: Option<f32>,
    pub weight_decay: f32,
    /// The probability of flipping a generated label, or the standard deviation of
    /// the noise added to a generated target.
    pub label_noise: f32,
    /// The fraction of weights pruned to zero before training.
    pub pruning: f32,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            model: ModelKind::Classification,
            samples: NonZeroUsize::new(512).unwrap_or(NonZeroUsize::MIN),
            validation_samples: NonZeroUsize::new(128).unwrap_or(NonZeroUsize::MIN),
            features: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            batch_size: NonZeroUsize::new(32).unwrap_or(NonZeroUsize::MIN),
            epochs: 15,
            learning_rate: 0.1,
            momentum: Some(0.9),
            weight_decay: 5e-4,
            label_noise: 0.05,
            pruning: 0.,
        }
    }
}

/// The configuration of a whole tracked training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSpec {
    /// Seeds every random choice of the run, picked at random when absent.
    pub seed: Option<u64>,
    pub tracker: TrackerSpec,
    pub trainer: SyntheticSpec,
}

impl RunSpec {
    /// Reads a `RunSpec` from a json file, missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(HyperGradErr::io(path))?;

        serde_json::from_slice(&bytes).map_err(|source| HyperGradErr::Config {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_spec_takes_defaults() {
        let spec: RunSpec = serde_json::from_str(
            r#"{
                "seed": 3,
                "tracker": { "store": { "capacity": 64 }, "devices": ["cuda:0", "cuda:1"] },
                "trainer": { "model": "detection", "momentum": null }
            }"#,
        )
        .unwrap();

        assert_eq!(spec.seed, Some(3));
        assert_eq!(spec.tracker.store.capacity.get(), 64);
        assert_eq!(spec.tracker.snapshot, SnapshotSpec::default());
        assert_eq!(spec.tracker.devices(), vec![Device::Cuda(0), Device::Cuda(1)]);
        assert_eq!(spec.trainer.model, ModelKind::Detection);
        assert_eq!(spec.trainer.momentum, None);
        assert_eq!(spec.trainer.epochs, 15);
    }

    #[test]
    fn test_unreadable_spec_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");

        assert!(matches!(
            RunSpec::from_json_file(&path),
            Err(HyperGradErr::Io { .. })
        ));

        fs::write(&path, "{ \"seed\": \"x\" }").unwrap();
        assert!(matches!(
            RunSpec::from_json_file(&path),
            Err(HyperGradErr::Config { .. })
        ));
    }
}

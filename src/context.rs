use std::{fs, path::Path};

use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{HyperGradErr, Result};

const CONTEXT_FILE: &str = "run_context.json";

/// The identity and randomness source of one training run.
///
/// Every component that needs randomness derives its own generator from this value,
/// so a saved context replays the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub seed: u64,
}

impl RunContext {
    /// Creates a new `RunContext` with a fresh run id.
    ///
    /// # Arguments
    /// * `seed` - The run's seed, drawn from the thread rng when absent.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            seed: seed.unwrap_or_else(|| rand::rng().random()),
        }
    }

    /// Starts the run's main random stream.
    pub fn enable(&self) -> StdRng {
        info!(seed = self.seed; "run {} enabled", self.run_id);
        StdRng::seed_from_u64(self.seed)
    }

    /// Derives an independent random stream for a named component.
    pub fn rng_for(&self, stream: u64) -> StdRng {
        let mut seeder = StdRng::seed_from_u64(self.seed ^ stream.rotate_left(32));
        StdRng::from_rng(&mut seeder)
    }

    /// Writes the context as `run_context.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(HyperGradErr::io(dir))?;

        let path = dir.join(CONTEXT_FILE);
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| HyperGradErr::Config {
            path: path.clone(),
            source,
        })?;

        fs::write(&path, bytes).map_err(HyperGradErr::io(&path))
    }

    /// Reads a context previously written by `save` into `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CONTEXT_FILE);
        let bytes = fs::read(&path).map_err(HyperGradErr::io(&path))?;

        serde_json::from_slice(&bytes).map_err(|source| HyperGradErr::Config { path, source })
    }
}

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_FETCH_THREADS: usize = 10;

/// Construction settings of a `VectorStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The maximum amount of resident entries.
    pub capacity: NonZeroUsize,
    /// The amount of background readers serving `prefetch`.
    pub fetch_threads: NonZeroUsize,
    /// Emits a debug record for every load, eviction and flush.
    pub debug_logging: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            fetch_threads: NonZeroUsize::new(DEFAULT_FETCH_THREADS).unwrap_or(NonZeroUsize::MIN),
            debug_logging: false,
        }
    }
}

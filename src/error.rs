use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use device_pool::PoolErr;
use vector_store::StoreErr;

/// The result type used in the entire hyper-gradient crate.
pub type Result<T> = std::result::Result<T, HyperGradErr>;

/// The hyper-gradient crate's error type.
#[derive(Debug)]
pub enum HyperGradErr {
    Store(StoreErr),
    Pool(PoolErr),
    /// The optimizer can't be described by a single momentum-SGD coefficient tuple.
    UnsupportedOptimizerConfiguration {
        reason: String,
    },
    KeyOutOfRange {
        key: usize,
        keys: usize,
    },
    /// `after_batch` was called without any instance gradient.
    EmptyBatch {
        batch_index: usize,
    },
    Config {
        path: PathBuf,
        source: serde_json::Error,
    },
    Io {
        path: PathBuf,
        source: io::Error,
    },
}

impl HyperGradErr {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedOptimizerConfiguration {
            reason: reason.into(),
        }
    }
}

impl Display for HyperGradErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HyperGradErr::Store(e) => write!(f, "vector store failure: {e}"),
            HyperGradErr::Pool(e) => write!(f, "device pool failure: {e}"),
            HyperGradErr::UnsupportedOptimizerConfiguration { reason } => {
                write!(f, "unsupported optimizer configuration: {reason}")
            }
            HyperGradErr::KeyOutOfRange { key, keys } => {
                write!(f, "key {key} is outside of the training set of size {keys}")
            }
            HyperGradErr::EmptyBatch { batch_index } => {
                write!(f, "batch {batch_index} produced no instance gradients")
            }
            HyperGradErr::Config { path, source } => {
                write!(f, "invalid run spec {}: {source}", path.display())
            }
            HyperGradErr::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl Error for HyperGradErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HyperGradErr::Store(e) => Some(e),
            HyperGradErr::Pool(e) => Some(e),
            HyperGradErr::Config { source, .. } => Some(source),
            HyperGradErr::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<StoreErr> for HyperGradErr {
    fn from(value: StoreErr) -> Self {
        Self::Store(value)
    }
}

impl From<PoolErr> for HyperGradErr {
    fn from(value: PoolErr) -> Self {
        Self::Pool(value)
    }
}

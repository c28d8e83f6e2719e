use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::{Path, PathBuf},
};

use crate::Key;

/// The result type used across the vector store crate.
pub type Result<T> = std::result::Result<T, StoreErr>;

/// Errors surfaced by a `VectorStore`.
#[derive(Debug)]
pub enum StoreErr {
    /// `get` on a key that was never set.
    NotFound { key: Key },
    /// A vector, mask or stored file doesn't match the store's fixed shape.
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// A persistence read or write failed.
    Io { path: PathBuf, source: io::Error },
    /// Another live store already owns the directory.
    DirectoryInUse { path: PathBuf },
    /// The background fetch pool couldn't be built.
    FetchPool(String),
    /// The stored layout record is unreadable.
    Layout(serde_json::Error),
}

impl StoreErr {
    /// Builds a closure mapping an `io::Error` on `path` into a `StoreErr::Io`.
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreErr + '_ {
        move |source| StoreErr::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErr::NotFound { key } => write!(f, "key {key} has no stored vector"),
            StoreErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch on {what}: got {got}, expected {expected}"
            ),
            StoreErr::Io { path, source } => {
                write!(f, "storage io failure on {}: {source}", path.display())
            }
            StoreErr::DirectoryInUse { path } => {
                write!(f, "directory {} is owned by another store", path.display())
            }
            StoreErr::FetchPool(detail) => write!(f, "failed to build fetch pool: {detail}"),
            StoreErr::Layout(e) => write!(f, "invalid layout record: {e}"),
        }
    }
}

impl Error for StoreErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreErr::Io { source, .. } => Some(source),
            StoreErr::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Layout(value)
    }
}

use std::{error::Error, fmt, io};

use crate::Device;

/// The device pool's result type.
pub type Result<T> = std::result::Result<T, PoolErr>;

/// Device pool failures.
#[derive(Debug)]
pub enum PoolErr {
    /// The worker function failed or panicked while running a task.
    WorkerFailure {
        slot: usize,
        device: Device,
        detail: String,
    },
    /// A pool needs at least one device.
    NoDevices,
    /// The pool no longer accepts tasks.
    Stopped,
    /// A worker thread couldn't be spawned.
    Spawn(io::Error),
}

impl fmt::Display for PoolErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolErr::WorkerFailure {
                slot,
                device,
                detail,
            } => write!(f, "worker {slot} on {device} failed: {detail}"),
            PoolErr::NoDevices => f.write_str("no devices to bind workers to"),
            PoolErr::Stopped => f.write_str("the pool was stopped"),
            PoolErr::Spawn(e) => write!(f, "failed to spawn worker: {e}"),
        }
    }
}

impl Error for PoolErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PoolErr::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PoolErr {
    fn from(value: io::Error) -> Self {
        Self::Spawn(value)
    }
}

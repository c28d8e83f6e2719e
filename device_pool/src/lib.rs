//! A pool of worker threads, each exclusively bound to one execution device.

mod device;
mod error;
mod pool;

pub use device::Device;
pub use error::{PoolErr, Result};
pub use pool::{DeviceWorkerPool, TaskOutcome};

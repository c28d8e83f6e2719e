//! Tracks a per-sample hyper-gradient through momentum SGD training.
//!
//! Per-sample state lives in two out-of-core `vector_store`s, skipped updates are
//! folded lazily by the `recurrence` engine and per-sample gradients are computed on
//! a `device_pool`.

pub mod config;
pub mod context;
mod error;
pub mod hooks;
pub mod influence;
pub mod model;
pub mod recurrence;
pub mod runner;
pub mod snapshot;
pub mod tracker;
pub mod trainer;

pub use error::{HyperGradErr, Result};

//! An out-of-core keyed vector store.
//!
//! Vectors are addressed by a non negative integer key, kept in a bounded in-memory
//! tier and spilled to a directory the store exclusively owns.

mod cache;
mod codec;
mod config;
mod error;
mod layout;
mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreErr};
pub use layout::Layout;
pub use store::VectorStore;

/// Identifies one training sample.
pub type Key = usize;

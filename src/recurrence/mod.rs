mod coefficients;
mod engine;
mod state;

pub use coefficients::{Coefficients, PendingQueue};
pub use engine::LazyRecurrence;
pub use state::SampleState;

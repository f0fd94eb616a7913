//! Retry execution primitive used for every unreliable IO step.
//!
//! - `types`: units of work, outcomes, statistics
//! - `executor`: inline retry budget plus the background retry worker

pub mod executor;
pub mod types;

pub use executor::{ActionExecutor, ActionExecutorHandle};
pub use types::{ActionError, ActionFn, ActionInfo, ActionOutcome, ActionStats};

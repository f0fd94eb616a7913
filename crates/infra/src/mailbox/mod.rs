//! Per-key sequential, cross-key parallel processing.
//!
//! Commands, committed-stream deliveries and business exceptions all run
//! through an [`AggregateMailboxProcessor`] keyed by the id whose operations
//! must not interleave (aggregate id, exception id).

mod delay;
pub mod processor;

pub use processor::{AggregateMailboxProcessor, MailboxError, MailboxSender, MailboxStats};

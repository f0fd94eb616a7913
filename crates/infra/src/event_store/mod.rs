//! Append-only event store boundary.
//!
//! One ordered ledger of event streams per aggregate, with duplicate and
//! concurrency detection reported as [`AppendOutcome`]s.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{AppendOutcome, EventStore, EventStoreError};

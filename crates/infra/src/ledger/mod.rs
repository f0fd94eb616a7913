//! Publish-side bookkeeping shared across engine instances.
//!
//! - [`PublishedVersionStore`]: last version of each aggregate delivered to
//!   each downstream processor, advanced gap-free
//! - [`MessageHandleStore`]: which handler already handled which message
//!
//! These are the only cross-worker mutable state of the engine. Backends must
//! provide insert-if-absent and compare-and-set **at the storage layer**
//! (unique constraints, conditional updates, scripts); an in-process lock is
//! only enough for the single-process in-memory implementations.

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use thiserror::Error;

use eventlane_core::{AggregateId, MessageId};

pub use in_memory::{InMemoryMessageHandleStore, InMemoryPublishedVersionStore};
pub use postgres::{PostgresMessageHandleStore, PostgresPublishedVersionStore};
#[cfg(feature = "redis")]
pub use self::redis::RedisPublishedVersionStore;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Backend unreachable or failed mid-operation; retryable.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Stored value could not be interpreted.
    #[error("corrupt ledger entry: {0}")]
    Corrupt(String),
}

/// Result of the first-ever publish record for a `(processor, aggregate)` pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another worker initialized the record first. Callers treat this as success.
    AlreadyExists,
}

/// Result of recording a handled message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Added,
    /// The message was already recorded for this handler. Callers treat this as success.
    AlreadyExists,
}

/// Published-version ledger keyed by `(processor, aggregate_type, aggregate_id)`.
pub trait PublishedVersionStore: Send + Sync {
    /// Last published version, `0` when nothing was published yet.
    fn get_version(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, LedgerError>;

    /// Insert-if-absent of version `1`.
    fn insert_first(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<InsertOutcome, LedgerError>;

    /// Compare-and-set: move to `new_version` only if the stored value is
    /// `new_version - 1`. Returns `false` when the CAS lost.
    fn update(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        new_version: u64,
    ) -> Result<bool, LedgerError>;
}

/// Handled-message records keyed by `(message_id, handler_type_code)`.
pub trait MessageHandleStore: Send + Sync {
    fn add_record(&self, message_id: MessageId, handler_type_code: u32) -> Result<RecordOutcome, LedgerError>;

    fn record_exists(&self, message_id: MessageId, handler_type_code: u32) -> Result<bool, LedgerError>;
}

impl<S> PublishedVersionStore for Arc<S>
where
    S: PublishedVersionStore + ?Sized,
{
    fn get_version(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, LedgerError> {
        (**self).get_version(processor, aggregate_type, aggregate_id)
    }

    fn insert_first(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<InsertOutcome, LedgerError> {
        (**self).insert_first(processor, aggregate_type, aggregate_id)
    }

    fn update(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        new_version: u64,
    ) -> Result<bool, LedgerError> {
        (**self).update(processor, aggregate_type, aggregate_id, new_version)
    }
}

impl<S> MessageHandleStore for Arc<S>
where
    S: MessageHandleStore + ?Sized,
{
    fn add_record(&self, message_id: MessageId, handler_type_code: u32) -> Result<RecordOutcome, LedgerError> {
        (**self).add_record(message_id, handler_type_code)
    }

    fn record_exists(&self, message_id: MessageId, handler_type_code: u32) -> Result<bool, LedgerError> {
        (**self).record_exists(message_id, handler_type_code)
    }
}

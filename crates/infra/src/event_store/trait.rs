use std::sync::Arc;

use thiserror::Error;

use eventlane_core::{AggregateId, CommandId};
use eventlane_events::EventStream;

/// Result of appending one stream.
///
/// Duplicates and conflicts are **outcomes**, not errors: the command path
/// branches on them explicitly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The stream was stored.
    Success,
    /// A stream with the same `stream_id` is already stored (pure resend).
    DuplicateEvent,
    /// A different stream from the same command is already stored for this
    /// aggregate (idempotent replay of an applied command).
    DuplicateCommand,
    /// Another stream already occupies `(aggregate_id, version)`; reload the
    /// aggregate and re-run the command.
    ConcurrencyConflict,
}

/// Event store operation error.
///
/// These are **infrastructure errors**. Logical duplicates and version races
/// are reported through [`AppendOutcome`] instead.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The backend could not be reached or failed mid-operation; retryable.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    /// The stream itself is unacceptable (e.g. version 0); not retryable.
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Stored data could not be decoded.
    #[error("corrupt stored stream: {0}")]
    Corrupt(String),
}

impl EventStoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EventStoreError::Unavailable(_))
    }
}

/// Append-only event store, one ordered ledger per aggregate.
///
/// ## Constraints
///
/// Implementations must enforce three uniqueness rules atomically:
///
/// - `stream_id` guards pure at-least-once resend (`DuplicateEvent`)
/// - `(aggregate_id, version)` guards optimistic concurrency (`ConcurrencyConflict`)
/// - `(aggregate_id, command_id)` guards command idempotency (`DuplicateCommand`)
///
/// When the version slot is taken, implementations re-check by command id:
/// the same command means `DuplicateCommand`, anything else is a conflict.
///
/// Accepted versions are contiguous from 1: a stream whose version does not
/// directly follow the aggregate's current version is an
/// [`EventStoreError::InvalidAppend`].
///
/// ## Load Semantics
///
/// `query()` returns streams in ascending version order, inclusive on both
/// bounds, and an empty vector for an unknown aggregate.
pub trait EventStore: Send + Sync {
    fn append(&self, stream: &EventStream) -> Result<AppendOutcome, EventStoreError>;

    fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError>;

    fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(&self, stream: &EventStream) -> Result<AppendOutcome, EventStoreError> {
        (**self).append(stream)
    }

    fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError> {
        (**self).query(aggregate_id, aggregate_type, min_version, max_version)
    }

    fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        (**self).find_by_command(aggregate_id, command_id)
    }
}

/// Reject streams no backend should accept.
pub(crate) fn validate_stream(stream: &EventStream) -> Result<(), EventStoreError> {
    if stream.version() == 0 {
        return Err(EventStoreError::InvalidAppend(
            "stream version must start at 1".to_string(),
        ));
    }
    if stream.aggregate_type().is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "aggregate_type cannot be empty".to_string(),
        ));
    }
    Ok(())
}

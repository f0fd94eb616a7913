//! Postgres-backed event store implementation.
//!
//! One row per event stream in `event_streams` (see
//! `migrations/0001_eventlane.sql`). The three uniqueness rules of
//! [`EventStore`] are unique constraints, and the name of the violated
//! constraint decides the append outcome.
//!
//! ## Error Mapping
//!
//! | Violation | Constraint | Outcome |
//! |-----------|------------|---------|
//! | `23505` | `event_streams_pkey` (stream_id) | `DuplicateEvent` |
//! | `23505` | `uq_event_streams_aggregate_version` | `DuplicateCommand` if the command is stored, else `ConcurrencyConflict` |
//! | `23505` | `uq_event_streams_aggregate_command` | `DuplicateCommand` |
//! | no row inserted | predecessor version missing | `EventStoreError::InvalidAppend` |
//! | `23514` | check constraint or contiguity trigger | `EventStoreError::InvalidAppend` |
//! | any other | | `EventStoreError::Unavailable` |
//!
//! ## Sync Bridge
//!
//! [`EventStore`] is synchronous and is called from engine worker threads
//! (plain `std::thread`s), so the store owns a `tokio::runtime::Handle` and
//! drives each query with `Handle::block_on`. Do not call it from inside an
//! async task on that same runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use eventlane_core::{AggregateId, CommandId, StreamId};
use eventlane_events::{DomainEventRecord, EventStream};

use super::r#trait::{AppendOutcome, EventStore, EventStoreError, validate_stream};

const PKEY_CONSTRAINT: &str = "event_streams_pkey";
const VERSION_CONSTRAINT: &str = "uq_event_streams_aggregate_version";
const COMMAND_CONSTRAINT: &str = "uq_event_streams_aggregate_command";

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresEventStore {
    /// Create a store whose queries run on `runtime`.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(
        skip(self, stream),
        fields(
            aggregate_id = %stream.aggregate_id(),
            version = stream.version(),
            outcome
        ),
        err
    )]
    pub async fn append_stream(&self, stream: &EventStream) -> Result<AppendOutcome, EventStoreError> {
        validate_stream(stream)?;

        let events = serde_json::to_value(stream.events())
            .map_err(|e| EventStoreError::InvalidAppend(format!("failed to encode events: {e}")))?;
        let items = serde_json::to_value(stream.items())
            .map_err(|e| EventStoreError::InvalidAppend(format!("failed to encode items: {e}")))?;
        let version = i64::try_from(stream.version())
            .map_err(|_| EventStoreError::InvalidAppend("version exceeds i64".to_string()))?;

        let insert = sqlx::query(
            r#"
            INSERT INTO event_streams (
                stream_id,
                aggregate_id,
                aggregate_type,
                version,
                command_id,
                occurred_at,
                events,
                items
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE $4 = 1
               OR EXISTS (
                   SELECT 1 FROM event_streams
                   WHERE aggregate_id = $2 AND version = $4 - 1
               )
            "#,
        )
        .bind(stream.stream_id().as_uuid())
        .bind(stream.aggregate_id().as_uuid())
        .bind(stream.aggregate_type())
        .bind(version)
        .bind(stream.command_id().as_uuid())
        .bind(stream.timestamp())
        .bind(events)
        .bind(items)
        .execute(&*self.pool)
        .await;

        let outcome = match insert {
            Ok(done) if done.rows_affected() == 0 => {
                return Err(EventStoreError::InvalidAppend(format!(
                    "version {} has no predecessor",
                    stream.version()
                )));
            }
            Ok(_) => AppendOutcome::Success,
            Err(err) => match violated_unique_constraint(&err).map(str::to_owned).as_deref() {
                Some(PKEY_CONSTRAINT) => AppendOutcome::DuplicateEvent,
                Some(COMMAND_CONSTRAINT) => AppendOutcome::DuplicateCommand,
                Some(VERSION_CONSTRAINT) => {
                    if self
                        .find_stream_by_command(stream.aggregate_id(), stream.command_id())
                        .await?
                        .is_some()
                    {
                        AppendOutcome::DuplicateCommand
                    } else {
                        AppendOutcome::ConcurrencyConflict
                    }
                }
                _ => return Err(map_sqlx_error("append_stream", err)),
            },
        };

        Span::current().record("outcome", tracing::field::debug(outcome));
        Ok(outcome)
    }

    /// Load streams with `min_version <= version <= max_version`, ascending.
    #[instrument(
        skip(self),
        fields(aggregate_id = %aggregate_id, stream_count),
        err
    )]
    pub async fn query_streams(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError> {
        let min = i64::try_from(min_version).unwrap_or(i64::MAX);
        let max = i64::try_from(max_version).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT stream_id, aggregate_id, aggregate_type, version, command_id, occurred_at, events, items
            FROM event_streams
            WHERE aggregate_id = $1 AND aggregate_type = $2 AND version >= $3 AND version <= $4
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(aggregate_type)
        .bind(min)
        .bind(max)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_streams", e))?;

        let streams = rows
            .iter()
            .map(stream_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Span::current().record("stream_count", streams.len());
        Ok(streams)
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id, command_id = %command_id), err)]
    pub async fn find_stream_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT stream_id, aggregate_id, aggregate_type, version, command_id, occurred_at, events, items
            FROM event_streams
            WHERE aggregate_id = $1 AND command_id = $2
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(command_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stream_by_command", e))?;

        row.as_ref().map(stream_from_row).transpose()
    }
}

impl EventStore for PostgresEventStore {
    fn append(&self, stream: &EventStream) -> Result<AppendOutcome, EventStoreError> {
        self.runtime.block_on(self.append_stream(stream))
    }

    fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError> {
        self.runtime
            .block_on(self.query_streams(aggregate_id, aggregate_type, min_version, max_version))
    }

    fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        self.runtime
            .block_on(self.find_stream_by_command(aggregate_id, command_id))
    }
}

fn stream_from_row(row: &sqlx::postgres::PgRow) -> Result<EventStream, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Corrupt(format!("failed to read stream row: {e}"));

    let stream_id: uuid::Uuid = row.try_get("stream_id").map_err(decode)?;
    let aggregate_id: uuid::Uuid = row.try_get("aggregate_id").map_err(decode)?;
    let aggregate_type: String = row.try_get("aggregate_type").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let command_id: uuid::Uuid = row.try_get("command_id").map_err(decode)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(decode)?;
    let events: serde_json::Value = row.try_get("events").map_err(decode)?;
    let items: serde_json::Value = row.try_get("items").map_err(decode)?;

    let events: Vec<DomainEventRecord> = serde_json::from_value(events)
        .map_err(|e| EventStoreError::Corrupt(format!("failed to decode events: {e}")))?;
    let items: BTreeMap<String, String> = serde_json::from_value(items)
        .map_err(|e| EventStoreError::Corrupt(format!("failed to decode items: {e}")))?;

    Ok(EventStream::new(
        StreamId::from_uuid(stream_id),
        AggregateId::from_uuid(aggregate_id),
        aggregate_type,
        version as u64,
        CommandId::from_uuid(command_id),
        occurred_at,
        events,
        items,
    ))
}

/// Name of the violated unique constraint, if `err` is a unique violation.
fn violated_unique_constraint(err: &sqlx::Error) -> Option<&str> {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return db_err.constraint();
        }
    }
    None
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

//! Postgres-backed ledgers.
//!
//! Tables `published_versions` and `message_handles` (see
//! `migrations/0001_eventlane.sql`). Insert-if-absent is
//! `INSERT ... ON CONFLICT DO NOTHING`; compare-and-set is an `UPDATE` guarded
//! by the expected previous version. Both are decided by affected row count.

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use eventlane_core::{AggregateId, MessageId};

use super::{InsertOutcome, LedgerError, MessageHandleStore, PublishedVersionStore, RecordOutcome};

#[derive(Debug, Clone)]
pub struct PostgresPublishedVersionStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresPublishedVersionStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn fetch_version(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT version
            FROM published_versions
            WHERE processor_name = $1 AND aggregate_type = $2 AND aggregate_id = $3
            "#,
        )
        .bind(processor)
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_version", e))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
                Ok(version as u64)
            }
            None => Ok(0),
        }
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn insert_initial(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<InsertOutcome, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO published_versions (processor_name, aggregate_type, aggregate_id, version)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (processor_name, aggregate_type, aggregate_id) DO NOTHING
            "#,
        )
        .bind(processor)
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_initial", e))?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn compare_and_set(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        new_version: u64,
    ) -> Result<bool, LedgerError> {
        if new_version == 0 {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE published_versions
            SET version = $4, updated_at = NOW()
            WHERE processor_name = $1 AND aggregate_type = $2 AND aggregate_id = $3 AND version = $5
            "#,
        )
        .bind(processor)
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .bind(new_version as i64)
        .bind((new_version - 1) as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set", e))?;

        Ok(result.rows_affected() == 1)
    }
}

impl PublishedVersionStore for PostgresPublishedVersionStore {
    fn get_version(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, LedgerError> {
        self.runtime
            .block_on(self.fetch_version(processor, aggregate_type, aggregate_id))
    }

    fn insert_first(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<InsertOutcome, LedgerError> {
        self.runtime
            .block_on(self.insert_initial(processor, aggregate_type, aggregate_id))
    }

    fn update(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        new_version: u64,
    ) -> Result<bool, LedgerError> {
        self.runtime
            .block_on(self.compare_and_set(processor, aggregate_type, aggregate_id, new_version))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresMessageHandleStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresMessageHandleStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn insert_record(&self, message_id: MessageId, handler_type_code: u32) -> Result<RecordOutcome, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_handles (message_id, handler_type_code)
            VALUES ($1, $2)
            ON CONFLICT (message_id, handler_type_code) DO NOTHING
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(i64::from(handler_type_code))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_record", e))?;

        Ok(if result.rows_affected() == 1 {
            RecordOutcome::Added
        } else {
            RecordOutcome::AlreadyExists
        })
    }

    async fn fetch_record(&self, message_id: MessageId, handler_type_code: u32) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present
            FROM message_handles
            WHERE message_id = $1 AND handler_type_code = $2
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(i64::from(handler_type_code))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_record", e))?;

        Ok(row.is_some())
    }
}

impl MessageHandleStore for PostgresMessageHandleStore {
    fn add_record(&self, message_id: MessageId, handler_type_code: u32) -> Result<RecordOutcome, LedgerError> {
        self.runtime.block_on(self.insert_record(message_id, handler_type_code))
    }

    fn record_exists(&self, message_id: MessageId, handler_type_code: u32) -> Result<bool, LedgerError> {
        self.runtime.block_on(self.fetch_record(message_id, handler_type_code))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerError::Unavailable(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => LedgerError::Unavailable(format!("connection pool closed in {operation}")),
        _ => LedgerError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

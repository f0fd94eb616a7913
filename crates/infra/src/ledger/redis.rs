//! Redis-backed published-version ledger.
//!
//! One string key per `(processor, aggregate_type, aggregate_id)`:
//! `eventlane:published:{processor}:{aggregate_type}:{aggregate_id}`.
//!
//! - first publish: `SET key 1 NX`
//! - advance: a Lua script comparing the stored value before writing, so the
//!   check and the write are one atomic server-side step

use std::sync::Arc;

use tracing::warn;

use eventlane_core::AggregateId;

use super::{InsertOutcome, LedgerError, PublishedVersionStore};

const DEFAULT_KEY_PREFIX: &str = "eventlane:published";

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisPublishedVersionStore {
    client: Arc<redis::Client>,
    key_prefix: String,
    cas: Arc<redis::Script>,
}

impl RedisPublishedVersionStore {
    /// Create a store from a connection URL (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>, key_prefix: Option<String>) -> Result<Self, LedgerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            cas: Arc::new(redis::Script::new(CAS_SCRIPT)),
        })
    }

    fn key(&self, processor: &str, aggregate_type: &str, aggregate_id: AggregateId) -> String {
        format!("{}:{processor}:{aggregate_type}:{aggregate_id}", self.key_prefix)
    }

    fn connection(&self) -> Result<redis::Connection, LedgerError> {
        self.client
            .get_connection()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }
}

impl PublishedVersionStore for RedisPublishedVersionStore {
    fn get_version(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, LedgerError> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(processor, aggregate_type, aggregate_id))
            .query(&mut conn)
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        match value {
            None => Ok(0),
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                warn!(processor, aggregate_id = %aggregate_id, raw = %raw, "non-numeric published version");
                LedgerError::Corrupt(format!("published version is not a number: {raw}"))
            }),
        }
    }

    fn insert_first(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<InsertOutcome, LedgerError> {
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(processor, aggregate_type, aggregate_id))
            .arg(1u64)
            .arg("NX")
            .query(&mut conn)
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(match reply {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::AlreadyExists,
        })
    }

    fn update(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        new_version: u64,
    ) -> Result<bool, LedgerError> {
        if new_version == 0 {
            return Ok(false);
        }

        let mut conn = self.connection()?;
        let swapped: i64 = self
            .cas
            .key(self.key(processor, aggregate_type, aggregate_id))
            .arg((new_version - 1).to_string())
            .arg(new_version.to_string())
            .invoke(&mut conn)
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(swapped == 1)
    }
}

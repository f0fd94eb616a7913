use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use eventlane_core::{AggregateId, MessageId};

use super::{InsertOutcome, LedgerError, MessageHandleStore, PublishedVersionStore, RecordOutcome};

type VersionKey = (String, String, AggregateId);

fn version_key(processor: &str, aggregate_type: &str, aggregate_id: AggregateId) -> VersionKey {
    (processor.to_string(), aggregate_type.to_string(), aggregate_id)
}

/// Single-process published-version ledger (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryPublishedVersionStore {
    versions: Mutex<HashMap<VersionKey, u64>>,
}

impl InMemoryPublishedVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PublishedVersionStore for InMemoryPublishedVersionStore {
    fn get_version(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, LedgerError> {
        let versions = self
            .versions
            .lock()
            .map_err(|_| LedgerError::Unavailable("lock poisoned".to_string()))?;
        Ok(versions
            .get(&version_key(processor, aggregate_type, aggregate_id))
            .copied()
            .unwrap_or(0))
    }

    fn insert_first(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<InsertOutcome, LedgerError> {
        let mut versions = self
            .versions
            .lock()
            .map_err(|_| LedgerError::Unavailable("lock poisoned".to_string()))?;
        let key = version_key(processor, aggregate_type, aggregate_id);
        if versions.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        versions.insert(key, 1);
        Ok(InsertOutcome::Inserted)
    }

    fn update(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        new_version: u64,
    ) -> Result<bool, LedgerError> {
        let mut versions = self
            .versions
            .lock()
            .map_err(|_| LedgerError::Unavailable("lock poisoned".to_string()))?;
        match versions.get_mut(&version_key(processor, aggregate_type, aggregate_id)) {
            Some(current) if new_version > 0 && *current == new_version - 1 => {
                *current = new_version;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Single-process handled-message records (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryMessageHandleStore {
    records: Mutex<HashSet<(MessageId, u32)>>,
}

impl InMemoryMessageHandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageHandleStore for InMemoryMessageHandleStore {
    fn add_record(&self, message_id: MessageId, handler_type_code: u32) -> Result<RecordOutcome, LedgerError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| LedgerError::Unavailable("lock poisoned".to_string()))?;
        Ok(if records.insert((message_id, handler_type_code)) {
            RecordOutcome::Added
        } else {
            RecordOutcome::AlreadyExists
        })
    }

    fn record_exists(&self, message_id: MessageId, handler_type_code: u32) -> Result<bool, LedgerError> {
        let records = self
            .records
            .lock()
            .map_err(|_| LedgerError::Unavailable("lock poisoned".to_string()))?;
        Ok(records.contains(&(message_id, handler_type_code)))
    }
}

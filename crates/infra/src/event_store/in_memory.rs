use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use eventlane_core::{AggregateId, CommandId, StreamId};
use eventlane_events::EventStream;

use super::r#trait::{AppendOutcome, EventStore, EventStoreError, validate_stream};

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<AggregateId, BTreeMap<u64, EventStream>>,
    stream_ids: HashSet<StreamId>,
    commands: HashMap<(AggregateId, CommandId), u64>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Emulates the three unique constraints of the SQL
/// schema under a single write lock.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest stored version for an aggregate (0 when unknown).
    pub fn current_version(&self, aggregate_id: AggregateId) -> u64 {
        self.inner
            .read()
            .ok()
            .and_then(|inner| {
                inner
                    .streams
                    .get(&aggregate_id)
                    .and_then(|s| s.keys().next_back().copied())
            })
            .unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, stream: &EventStream) -> Result<AppendOutcome, EventStoreError> {
        validate_stream(stream)?;

        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        if inner.stream_ids.contains(&stream.stream_id()) {
            return Ok(AppendOutcome::DuplicateEvent);
        }

        let command_key = (stream.aggregate_id(), stream.command_id());
        let slot_taken = inner
            .streams
            .get(&stream.aggregate_id())
            .is_some_and(|s| s.contains_key(&stream.version()));

        if slot_taken {
            return Ok(if inner.commands.contains_key(&command_key) {
                AppendOutcome::DuplicateCommand
            } else {
                AppendOutcome::ConcurrencyConflict
            });
        }
        if inner.commands.contains_key(&command_key) {
            return Ok(AppendOutcome::DuplicateCommand);
        }

        let current = inner
            .streams
            .get(&stream.aggregate_id())
            .and_then(|s| s.keys().next_back().copied())
            .unwrap_or(0);
        if stream.version() != current + 1 {
            return Err(EventStoreError::InvalidAppend(format!(
                "version {} does not follow current version {current}",
                stream.version()
            )));
        }

        inner.stream_ids.insert(stream.stream_id());
        inner.commands.insert(command_key, stream.version());
        inner
            .streams
            .entry(stream.aggregate_id())
            .or_default()
            .insert(stream.version(), stream.clone());

        Ok(AppendOutcome::Success)
    }

    fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, EventStoreError> {
        if min_version > max_version {
            return Ok(vec![]);
        }

        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(inner
            .streams
            .get(&aggregate_id)
            .map(|s| {
                s.range(min_version..=max_version)
                    .map(|(_, stream)| stream)
                    .filter(|stream| stream.aggregate_type() == aggregate_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Result<Option<EventStream>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        Ok(inner
            .commands
            .get(&(aggregate_id, command_id))
            .and_then(|version| inner.streams.get(&aggregate_id)?.get(version))
            .cloned())
    }
}

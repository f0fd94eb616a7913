//! Committed event streams.
//!
//! An [`EventStream`] is the unit the engine appends, publishes and tracks:
//! every event produced by one command against one aggregate version.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventlane_core::{AggregateId, CommandId, StreamId};

use crate::reply::{AckPoint, ReplyTarget};
use crate::Event;

/// Item-bag key holding the caller's reply address (`host:port`).
pub const ITEM_REPLY_ADDRESS: &str = "reply_address";

/// Item-bag key holding the caller's acknowledgment point.
pub const ITEM_REPLY_ACK: &str = "reply_ack";

/// One serialized domain event inside a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEventRecord {
    pub event_type: String,
    pub event_version: u32,
    pub payload: JsonValue,
}

impl DomainEventRecord {
    pub fn from_typed<E>(event: &E) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            payload: serde_json::to_value(event)?,
        })
    }

    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// An immutable batch of events produced by one command execution.
///
/// Notes:
/// - `version` is the aggregate's pre-command version + 1.
/// - `stream_id` is unique across the store; it is derived from
///   `(command_id, aggregate_id)` by [`StreamId::for_command`].
/// - `items` is an opaque bag for cross-cutting context (e.g. reply address).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStream {
    stream_id: StreamId,
    aggregate_id: AggregateId,
    aggregate_type: String,
    version: u64,
    command_id: CommandId,
    timestamp: DateTime<Utc>,
    events: Vec<DomainEventRecord>,
    #[serde(default)]
    items: BTreeMap<String, String>,
}

impl EventStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: StreamId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: u64,
        command_id: CommandId,
        timestamp: DateTime<Utc>,
        events: Vec<DomainEventRecord>,
        items: BTreeMap<String, String>,
    ) -> Self {
        Self {
            stream_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            command_id,
            timestamp,
            events,
            items,
        }
    }

    /// Build a stream from typed events produced by `command_id`.
    pub fn from_typed<E>(
        command_id: CommandId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: u64,
        events: &[E],
        items: BTreeMap<String, String>,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        let records = events
            .iter()
            .map(DomainEventRecord::from_typed)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(
            StreamId::for_command(command_id, aggregate_id),
            aggregate_id,
            aggregate_type,
            version,
            command_id,
            Utc::now(),
            records,
            items,
        ))
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn events(&self) -> &[DomainEventRecord] {
        &self.events
    }

    pub fn items(&self) -> &BTreeMap<String, String> {
        &self.items
    }

    /// Decode every event into the aggregate's typed event.
    pub fn decode_events<E: DeserializeOwned>(&self) -> Result<Vec<E>, serde_json::Error> {
        self.events.iter().map(DomainEventRecord::decode).collect()
    }

    /// The caller's reply target, when the originating command carried one.
    pub fn reply_target(&self) -> Option<ReplyTarget> {
        let address = self.items.get(ITEM_REPLY_ADDRESS)?;
        let ack = self
            .items
            .get(ITEM_REPLY_ACK)
            .and_then(|v| v.parse::<AckPoint>().ok())
            .unwrap_or_default();
        Some(ReplyTarget::new(address.clone(), ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl Event for Deposited {
        fn event_type(&self) -> &'static str {
            "test.deposited"
        }
    }

    #[test]
    fn from_typed_derives_stream_id_and_decodes_back() {
        let command_id = CommandId::new();
        let aggregate_id = AggregateId::new();
        let stream = EventStream::from_typed(
            command_id,
            aggregate_id,
            "test.account",
            1,
            &[Deposited { amount: 100 }],
            BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(stream.stream_id(), StreamId::for_command(command_id, aggregate_id));
        assert_eq!(stream.events()[0].event_type, "test.deposited");
        let decoded: Vec<Deposited> = stream.decode_events().unwrap();
        assert_eq!(decoded, vec![Deposited { amount: 100 }]);
    }

    #[test]
    fn reply_target_reads_item_bag() {
        let mut items = BTreeMap::new();
        items.insert(ITEM_REPLY_ADDRESS.to_string(), "127.0.0.1:9000".to_string());
        items.insert(ITEM_REPLY_ACK.to_string(), AckPoint::EventHandled.to_string());

        let stream = EventStream::from_typed::<Deposited>(
            CommandId::new(),
            AggregateId::new(),
            "test.account",
            1,
            &[],
            items,
        )
        .unwrap();

        let target = stream.reply_target().unwrap();
        assert_eq!(target.address(), "127.0.0.1:9000");
        assert_eq!(target.ack(), AckPoint::EventHandled);
    }
}

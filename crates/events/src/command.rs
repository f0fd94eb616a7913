use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventlane_core::{AggregateId, CommandId};

use crate::reply::ReplyTarget;
use crate::stream::{ITEM_REPLY_ACK, ITEM_REPLY_ADDRESS};

/// A command targets a specific aggregate (command abstraction).
///
/// Commands represent **intent** - a request to perform an action on an aggregate.
/// They are **transient** (not persisted) and are transformed into events (which are persisted).
///
/// ## Aggregate Targeting
///
/// Commands must specify which aggregate they target via `target_aggregate_id()`. This enables:
/// - **Routing**: the mailbox routes commands to the lane owning the aggregate
/// - **Isolation**: each command operates on one aggregate (transaction boundary)
/// - **Concurrency**: different aggregates can process commands concurrently
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}

/// A command plus the metadata the engine needs to execute and acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope<C> {
    command_id: CommandId,
    aggregate_id: AggregateId,
    timestamp: DateTime<Utc>,
    reply: Option<ReplyTarget>,
    items: BTreeMap<String, String>,
    payload: C,
}

impl<C: Command> CommandEnvelope<C> {
    /// Wrap a command with a fresh command id.
    pub fn new(payload: C) -> Self {
        Self::with_id(CommandId::new(), payload)
    }

    /// Wrap a command with a caller-chosen (e.g. deterministic) command id.
    pub fn with_id(command_id: CommandId, payload: C) -> Self {
        Self {
            command_id,
            aggregate_id: payload.target_aggregate_id(),
            timestamp: Utc::now(),
            reply: None,
            items: BTreeMap::new(),
            payload,
        }
    }
}

impl<C> CommandEnvelope<C> {
    pub fn with_reply(mut self, reply: ReplyTarget) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.insert(key.into(), value.into());
        self
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn reply(&self) -> Option<&ReplyTarget> {
        self.reply.as_ref()
    }

    pub fn payload(&self) -> &C {
        &self.payload
    }

    /// Item bag to copy onto the committed stream (includes the reply target).
    pub fn stream_items(&self) -> BTreeMap<String, String> {
        let mut items = self.items.clone();
        if let Some(reply) = &self.reply {
            items.insert(ITEM_REPLY_ADDRESS.to_string(), reply.address().to_string());
            items.insert(ITEM_REPLY_ACK.to_string(), reply.ack().to_string());
        }
        items
    }
}

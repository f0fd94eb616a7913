//! Committed-stream publishing.
//!
//! The command side hands every committed stream to a [`StreamPublisher`]:
//! either straight to an in-process [`EventPublishingPipeline`], or onto a
//! topic bus through [`TopicEventPublisher`] for a
//! [`TopicConsumer`](crate::workers::TopicConsumer) to feed into a pipeline.

pub mod pipeline;

use thiserror::Error;
use tracing::debug;

use eventlane_events::{EventBus, EventStream};

use crate::mailbox::MailboxError;

pub use pipeline::{EventPublishingPipeline, PipelineBuilder, PipelineStats, StreamProcessor};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("bus publish failed: {0}")]
    Bus(String),

    #[error("stream encode failed: {0}")]
    Encode(String),

    #[error("pipeline closed: {0}")]
    Closed(String),
}

impl From<MailboxError> for PublishError {
    fn from(err: MailboxError) -> Self {
        PublishError::Closed(err.to_string())
    }
}

/// Hands committed streams downstream. Republishing a stream must be safe.
pub trait StreamPublisher: Send + Sync {
    fn publish(&self, stream: &EventStream) -> Result<(), PublishError>;
}

impl<P> StreamPublisher for std::sync::Arc<P>
where
    P: StreamPublisher + ?Sized,
{
    fn publish(&self, stream: &EventStream) -> Result<(), PublishError> {
        (**self).publish(stream)
    }
}

/// Topic streams of an aggregate type are published to.
pub fn topic_for(aggregate_type: &str) -> String {
    format!("eventlane.{aggregate_type}")
}

/// Publishes JSON stream envelopes to the topic of their aggregate type.
#[derive(Debug)]
pub struct TopicEventPublisher<B> {
    bus: B,
}

impl<B> TopicEventPublisher<B>
where
    B: EventBus<String>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> StreamPublisher for TopicEventPublisher<B>
where
    B: EventBus<String>,
{
    fn publish(&self, stream: &EventStream) -> Result<(), PublishError> {
        let envelope = serde_json::to_string(stream).map_err(|e| PublishError::Encode(e.to_string()))?;
        let topic = topic_for(stream.aggregate_type());
        self.bus
            .publish(&topic, envelope)
            .map_err(|e| PublishError::Bus(e.to_string()))?;
        debug!(
            topic = %topic,
            aggregate_id = %stream.aggregate_id(),
            version = stream.version(),
            "stream published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use eventlane_core::{AggregateId, CommandId, StreamId};
    use eventlane_events::InMemoryEventBus;

    use super::*;

    #[test]
    fn topic_publisher_sends_decodable_envelopes() {
        let bus = Arc::new(InMemoryEventBus::<String>::new());
        let subscription = bus.subscribe(&[&topic_for("bank.account")]);
        let publisher = TopicEventPublisher::new(bus.clone());

        let (command_id, aggregate_id) = (CommandId::new(), AggregateId::new());
        let stream = EventStream::new(
            StreamId::for_command(command_id, aggregate_id),
            aggregate_id,
            "bank.account",
            1,
            command_id,
            chrono::Utc::now(),
            vec![],
            BTreeMap::new(),
        );
        publisher.publish(&stream).unwrap();

        let envelope = subscription.recv_timeout(Duration::from_secs(1)).unwrap();
        let decoded: EventStream = serde_json::from_str(&envelope).unwrap();
        assert_eq!(decoded, stream);
    }
}

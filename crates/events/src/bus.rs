//! Topic-based publish transport abstraction (mechanics only).
//!
//! The bus distributes serialized stream envelopes from the command side to
//! consumers (publishing pipelines in this or other processes). It makes
//! minimal assumptions:
//!
//! - **Topic-addressed**: producers publish to a named topic; consumers
//!   subscribe to one or more topics
//! - **At-least-once delivery**: messages may be delivered more than once;
//!   the publish pipeline's version ledger and idempotency records absorb that
//! - **Per-topic FIFO per subscriber**: messages published to one topic
//!   arrive at a subscriber in publish order; nothing is promised across topics
//! - **No persistence**: the event store is the source of truth

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to one or more topics.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe(&["bank.account"]);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(message) => process(message)?,
///         Err(RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,  // Bus closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic, topic-based message bus.
///
/// ```text
/// Command → Event Store (append) → Event Bus (publish to topic) → Consumers
///                                                                   └─ Publishing pipeline
/// ```
///
/// `publish()` can fail (bus closed, network error). Failures are surfaced to
/// the caller, which retries through the action executor; since streams are
/// already persisted, republishing is safe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self, topics: &[&str]) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        (**self).publish(topic, message)
    }

    fn subscribe(&self, topics: &[&str]) -> Subscription<M> {
        (**self).subscribe(topics)
    }
}

//! In-memory topic bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

/// In-memory topic pub/sub bus.
///
/// - No IO / no async
/// - Fan-out to every subscriber of the topic
/// - Messages to a topic with no subscribers are dropped
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<M>>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        let mut topics = self.topics.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        if let Some(subs) = topics.get_mut(topic) {
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        Ok(())
    }

    fn subscribe(&self, topics: &[&str]) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut registry) = self.topics.lock() {
            for topic in topics {
                registry.entry((*topic).to_string()).or_default().push(tx.clone());
            }
        }

        Subscription::new(rx)
    }
}

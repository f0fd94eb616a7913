//! Background workers.

pub mod topic_consumer;

pub use topic_consumer::{TopicConsumer, WorkerHandle};

//! `eventlane-core`: engine foundation building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, Versioned};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CommandId, MessageId, StreamId};

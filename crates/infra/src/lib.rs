//! Engine layer: event stores, ledgers, mailboxes, pipelines, replies.
//!
//! ```text
//! CommandEnvelope → CommandProcessor (mailbox lane per aggregate)
//!                     ├─ EventStore::append (Success | Duplicate* | ConcurrencyConflict)
//!                     ├─ StreamPublisher ──→ EventPublishingPipeline (lane per processor+aggregate)
//!                     │                        ├─ PublishedVersionStore (gap check, CAS advance)
//!                     │                        └─ MessageHandleStore (handler idempotency)
//!                     ├─ ExceptionPublisher → ExceptionDispatchPipeline → CommandSink
//!                     └─ ReplySink ────────→ ReplyDeliveryService (pooled connections)
//! ```
//!
//! Every unreliable call goes through the [`actions::ActionExecutor`].

pub mod actions;
pub mod command_processor;
pub mod config;
pub mod event_store;
pub mod exception;
pub mod ledger;
pub mod mailbox;
pub mod publishing;
pub mod reply;
pub mod workers;


pub use command_processor::{CommandFailure, CommandProcessor, CommandStats};
pub use config::{ConfigError, EngineConfig};

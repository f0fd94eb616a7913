//! `eventlane-events`: message mechanics shared by the command and publish sides.

pub mod bus;
pub mod command;
pub mod event;
pub mod exception;
pub mod handler;
pub mod in_memory_bus;
pub mod reply;
pub mod stream;

pub use bus::{EventBus, Subscription};
pub use command::{Command, CommandEnvelope};
pub use event::Event;
pub use exception::{ExceptionHandler, FollowUpCommand, IssuedCommand, PublishableException};
pub use handler::{EventStreamHandler, FnStreamHandler};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use reply::{AckPoint, CommandResult, CommandStatus, ReplyMessage, ReplyTarget, ReplyType};
pub use stream::{DomainEventRecord, EventStream, ITEM_REPLY_ACK, ITEM_REPLY_ADDRESS};

//! Business exception dispatch.
//!
//! The command processor publishes a [`PublishableException`] whenever an
//! aggregate rejects a command with a business rule violation. The
//! [`ExceptionDispatchPipeline`] runs every handler registered for the
//! exception type and issues their follow-up commands through a
//! [`CommandSink`].

pub mod dispatcher;

use std::sync::Arc;

use eventlane_events::{IssuedCommand, PublishableException};

pub use dispatcher::{ExceptionDispatchPipeline, ExceptionPipelineBuilder, ExceptionStats};

/// Where the command side sends business exceptions.
pub trait ExceptionPublisher: Send + Sync {
    fn publish_exception(&self, exception: PublishableException) -> anyhow::Result<()>;
}

/// Where follow-up commands go (a command processor, a remote queue, ...).
///
/// The same exception may be redelivered, so the same [`IssuedCommand`] (same
/// command id) may be sent more than once.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: IssuedCommand) -> anyhow::Result<()>;
}

impl<P> ExceptionPublisher for Arc<P>
where
    P: ExceptionPublisher + ?Sized,
{
    fn publish_exception(&self, exception: PublishableException) -> anyhow::Result<()> {
        (**self).publish_exception(exception)
    }
}

impl<S> CommandSink for Arc<S>
where
    S: CommandSink + ?Sized,
{
    fn send(&self, command: IssuedCommand) -> anyhow::Result<()> {
        (**self).send(command)
    }
}

//! Publishable business exceptions (mechanics only, no business rules).
//!
//! - A command that violates a business rule produces a [`PublishableException`]
//! - Infra dispatches it to every [`ExceptionHandler`] registered for its type
//! - Handlers react by emitting [`FollowUpCommand`]s (e.g. compensations)
//! - Infra assigns each follow-up a deterministic command id, so redelivering
//!   the same exception never issues a second, distinct command

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventlane_core::{AggregateId, CommandId, MessageId};

/// A business rule violation raised while executing a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishableException {
    pub exception_id: MessageId,
    /// Concrete exception type; handlers register against this.
    pub exception_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub command_id: CommandId,
    pub message: String,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl PublishableException {
    /// Build the exception raised by `command_id`.
    ///
    /// The exception id is derived from the command id and exception type, so a
    /// redelivered command raising the same violation yields the same id.
    pub fn raised_by(
        command_id: CommandId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        exception_type: impl Into<String>,
        message: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        let exception_type = exception_type.into();
        Self {
            exception_id: MessageId::for_exception(command_id, &exception_type),
            exception_type,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            command_id,
            message: message.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// A command an exception handler wants issued.
///
/// `business_key` identifies the command within the handler's reaction
/// (e.g. "refund:acct-42"); together with the exception id, handler type code
/// and command type code it determines the command id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpCommand {
    pub command_type: String,
    pub command_type_code: u32,
    pub business_key: String,
    pub aggregate_id: AggregateId,
    pub payload: JsonValue,
}

/// A follow-up command with its engine-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCommand {
    pub command_id: CommandId,
    /// The exception this command reacts to.
    pub caused_by: MessageId,
    pub command: FollowUpCommand,
}

/// Reacts to business exceptions of the types it registers for.
pub trait ExceptionHandler: Send + Sync + 'static {
    /// Stable handler name (used in logs).
    fn name(&self) -> &str;

    /// Stable numeric handler type code (part of follow-up command ids).
    fn type_code(&self) -> u32;

    /// React to an exception, returning zero or more follow-up commands.
    fn handle(&self, exception: &PublishableException) -> anyhow::Result<Vec<FollowUpCommand>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_command_and_type_give_same_exception_id() {
        let command_id = CommandId::new();
        let aggregate_id = AggregateId::new();

        let a = PublishableException::raised_by(
            command_id,
            aggregate_id,
            "bank.account",
            "insufficient_funds",
            "balance too low",
            JsonValue::Null,
        );
        let b = PublishableException::raised_by(
            command_id,
            aggregate_id,
            "bank.account",
            "insufficient_funds",
            "balance too low",
            JsonValue::Null,
        );

        assert_eq!(a.exception_id, b.exception_id);
    }
}

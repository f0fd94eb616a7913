//! Command outcomes and the messages that carry them back to callers.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventlane_core::{AggregateId, CommandId};

/// When the caller wants to be acknowledged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPoint {
    /// Reply once the command's stream is committed (or the command failed).
    #[default]
    CommandExecuted,
    /// Reply once an acknowledging processor has handled the committed stream.
    EventHandled,
}

impl fmt::Display for AckPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckPoint::CommandExecuted => f.write_str("command_executed"),
            AckPoint::EventHandled => f.write_str("event_handled"),
        }
    }
}

impl FromStr for AckPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command_executed" => Ok(AckPoint::CommandExecuted),
            "event_handled" => Ok(AckPoint::EventHandled),
            other => Err(format!("unknown ack point: {other}")),
        }
    }
}

/// Where (and when) to deliver a command's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    address: String,
    ack: AckPoint,
}

impl ReplyTarget {
    /// `address` is expected to be `host:port`; it is validated at send time.
    pub fn new(address: impl Into<String>, ack: AckPoint) -> Self {
        Self {
            address: address.into(),
            ack,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn ack(&self) -> AckPoint {
        self.ack
    }
}

/// Numeric reply-type code on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ReplyType {
    CommandExecuted = 1,
    DomainEventHandled = 2,
}

impl ReplyType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(ReplyType::CommandExecuted),
            2 => Some(ReplyType::DomainEventHandled),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    /// The command was accepted but produced no events.
    NothingChanged,
    Failed,
}

/// Outcome of one command, as reported to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub aggregate_id: AggregateId,
    pub status: CommandStatus,
    /// Failure message or handler-provided result payload.
    pub result: Option<JsonValue>,
    /// Type hint for `result` (e.g. the error kind).
    pub result_type: Option<String>,
}

impl CommandResult {
    pub fn success(command_id: CommandId, aggregate_id: AggregateId) -> Self {
        Self {
            command_id,
            aggregate_id,
            status: CommandStatus::Success,
            result: None,
            result_type: None,
        }
    }

    pub fn nothing_changed(command_id: CommandId, aggregate_id: AggregateId) -> Self {
        Self {
            status: CommandStatus::NothingChanged,
            ..Self::success(command_id, aggregate_id)
        }
    }

    pub fn failed(
        command_id: CommandId,
        aggregate_id: AggregateId,
        result_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            aggregate_id,
            status: CommandStatus::Failed,
            result: Some(JsonValue::String(message.into())),
            result_type: Some(result_type.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != CommandStatus::Failed
    }
}

/// Payload of a one-way reply request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub reply_type: ReplyType,
    pub result: CommandResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_point_parses_its_display_form() {
        for ack in [AckPoint::CommandExecuted, AckPoint::EventHandled] {
            assert_eq!(ack.to_string().parse::<AckPoint>().unwrap(), ack);
        }
        assert!("sometime".parse::<AckPoint>().is_err());
    }

    #[test]
    fn reply_type_codes_are_stable() {
        assert_eq!(ReplyType::CommandExecuted.code(), 1);
        assert_eq!(ReplyType::DomainEventHandled.code(), 2);
        assert_eq!(ReplyType::from_code(2), Some(ReplyType::DomainEventHandled));
        assert_eq!(ReplyType::from_code(9), None);
    }

    #[test]
    fn failed_result_is_not_success() {
        let result = CommandResult::failed(CommandId::new(), AggregateId::new(), "validation", "bad");
        assert!(!result.is_success());
        assert!(CommandResult::nothing_changed(CommandId::new(), AggregateId::new()).is_success());
    }
}

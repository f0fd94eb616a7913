//! Strongly-typed identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Namespace for name-based (v5) identifiers derived by the engine.
///
/// Changing this value changes every derived id, which breaks deduplication
/// against ids already persisted.
const DERIVED_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_52a4_9d0e_4b7a_a3f1_0e5c_2d8b_7a19);

/// Identifier of an aggregate root.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

/// Identifier of a command (client-assigned or derived).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

/// Identifier of a committed event stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

/// Identifier of a published message (e.g. a business exception).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(AggregateId, "AggregateId");
impl_uuid_newtype!(CommandId, "CommandId");
impl_uuid_newtype!(StreamId, "StreamId");
impl_uuid_newtype!(MessageId, "MessageId");

fn derive(parts: &[&[u8]]) -> Uuid {
    // Length-prefix each part so ("ab", "c") and ("a", "bc") never collide.
    let mut name = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
    for part in parts {
        name.extend_from_slice(&(part.len() as u32).to_be_bytes());
        name.extend_from_slice(part);
    }
    Uuid::new_v5(&DERIVED_ID_NAMESPACE, &name)
}

impl StreamId {
    /// Stream id for the stream produced by `command_id` against `aggregate_id`.
    ///
    /// Re-running the same command against the same aggregate yields the same
    /// stream id, which is what lets the store report `DuplicateEvent`.
    pub fn for_command(command_id: CommandId, aggregate_id: AggregateId) -> Self {
        Self(derive(&[
            b"stream",
            command_id.as_uuid().as_bytes(),
            aggregate_id.as_uuid().as_bytes(),
        ]))
    }
}

/// A committed stream is the message its handlers record as handled.
impl From<StreamId> for MessageId {
    fn from(stream_id: StreamId) -> Self {
        Self(stream_id.0)
    }
}

impl MessageId {
    /// Exception id for a business exception raised while executing `command_id`.
    pub fn for_exception(command_id: CommandId, exception_type: &str) -> Self {
        Self(derive(&[
            b"exception",
            command_id.as_uuid().as_bytes(),
            exception_type.as_bytes(),
        ]))
    }
}

impl CommandId {
    /// Deterministic id for a follow-up command emitted by an exception handler.
    ///
    /// Built from `(exception_id, handler_type_code, command_type_code, business_key)`
    /// so that redelivering the same exception to the same handler produces the
    /// same command id.
    pub fn for_follow_up(
        exception_id: MessageId,
        handler_type_code: u32,
        command_type_code: u32,
        business_key: &str,
    ) -> Self {
        Self(derive(&[
            b"follow_up",
            exception_id.as_uuid().as_bytes(),
            &handler_type_code.to_be_bytes(),
            &command_type_code.to_be_bytes(),
            business_key.as_bytes(),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_is_stable_per_command_and_aggregate() {
        let command_id = CommandId::new();
        let aggregate_id = AggregateId::new();

        let a = StreamId::for_command(command_id, aggregate_id);
        let b = StreamId::for_command(command_id, aggregate_id);
        let other = StreamId::for_command(CommandId::new(), aggregate_id);

        assert_eq!(a, b);
        assert_ne!(a, other);
    }

    #[test]
    fn follow_up_id_depends_on_every_part() {
        let exception_id = MessageId::new();
        let base = CommandId::for_follow_up(exception_id, 7, 11, "acct-1");

        assert_eq!(base, CommandId::for_follow_up(exception_id, 7, 11, "acct-1"));
        assert_ne!(base, CommandId::for_follow_up(MessageId::new(), 7, 11, "acct-1"));
        assert_ne!(base, CommandId::for_follow_up(exception_id, 8, 11, "acct-1"));
        assert_ne!(base, CommandId::for_follow_up(exception_id, 7, 12, "acct-1"));
        assert_ne!(base, CommandId::for_follow_up(exception_id, 7, 11, "acct-2"));
    }

    #[test]
    fn parse_round_trips_display() {
        let id = AggregateId::new();
        let parsed: AggregateId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let err = "not-a-uuid".parse::<CommandId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("CommandId")));
    }
}

//! Command outcome delivery back to the caller.
//!
//! - `transport`: connection seam, TCP implementation, frame codec
//! - `service`: pooled delivery with idle/disconnect eviction

pub mod service;
pub mod transport;

use thiserror::Error;

use eventlane_events::{CommandResult, ReplyType};

pub use service::{ReplyDeliveryService, ReplyStats};
pub use transport::{
    ReplyConnection, ReplyConnector, TcpReplyConnector, encode_reply_frame, read_reply_frame, resolve_address,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("invalid reply address: {0:?}")]
    InvalidAddress(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("receive failed: {0}")]
    Receive(String),
}

/// Where the engine hands command outcomes.
///
/// Fire-and-forget: implementations log their own failures.
pub trait ReplySink: Send + Sync {
    fn send_reply(&self, reply_type: ReplyType, result: &CommandResult, address: &str);
}

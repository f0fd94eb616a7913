//! Reply transport seam and its TCP implementation.
//!
//! ## Frame Layout
//!
//! ```text
//! +----------------+------------------+---------------------------+
//! | length: u32 BE | reply type: u16 BE | CommandResult as JSON    |
//! +----------------+------------------+---------------------------+
//! ```
//!
//! `length` counts everything after itself (type code plus JSON).

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use eventlane_events::{CommandResult, ReplyMessage, ReplyType};

use super::ReplyError;
use crate::config::ReplyConfig;

/// Largest frame `read_reply_frame` accepts.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One live connection to a reply address.
pub trait ReplyConnection: Send {
    /// Write one complete frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), ReplyError>;

    /// Best-effort liveness probe; `false` once the peer is known to be gone.
    fn is_connected(&self) -> bool;
}

/// Opens connections to reply addresses.
pub trait ReplyConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Box<dyn ReplyConnection>, ReplyError>;
}

/// Parse a `host:port` reply address.
pub fn resolve_address(address: &str) -> Result<SocketAddr, ReplyError> {
    let invalid = || ReplyError::InvalidAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }

    address
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

pub fn encode_reply_frame(reply_type: ReplyType, result: &CommandResult) -> Result<Vec<u8>, ReplyError> {
    let body = serde_json::to_vec(result).map_err(|e| ReplyError::Encode(e.to_string()))?;
    let len = u32::try_from(body.len() + 2)
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| ReplyError::Encode(format!("reply of {} bytes is too large", body.len())))?;

    let mut frame = Vec::with_capacity(body.len() + 6);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&reply_type.code().to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame written by [`encode_reply_frame`] (the caller's side).
pub fn read_reply_frame(reader: &mut impl Read) -> Result<ReplyMessage, ReplyError> {
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .map_err(|e| ReplyError::Receive(e.to_string()))?;
    let len = u32::from_be_bytes(len);
    if !(2..=MAX_FRAME_LEN).contains(&len) {
        return Err(ReplyError::Receive(format!("invalid frame length {len}")));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .map_err(|e| ReplyError::Receive(e.to_string()))?;

    let code = u16::from_be_bytes([body[0], body[1]]);
    let reply_type =
        ReplyType::from_code(code).ok_or_else(|| ReplyError::Receive(format!("unknown reply type {code}")))?;
    let result: CommandResult =
        serde_json::from_slice(&body[2..]).map_err(|e| ReplyError::Receive(e.to_string()))?;

    Ok(ReplyMessage { reply_type, result })
}

/// Plain TCP reply connections with connect and write timeouts.
#[derive(Debug, Clone)]
pub struct TcpReplyConnector {
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl TcpReplyConnector {
    pub fn new(connect_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            send_timeout,
        }
    }

    /// Connector using the configured connect and send timeouts.
    pub fn from_config(config: &ReplyConfig) -> Self {
        Self::new(config.connect_timeout, config.send_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}

impl ReplyConnector for TcpReplyConnector {
    fn connect(&self, address: &str) -> Result<Box<dyn ReplyConnection>, ReplyError> {
        let addr = resolve_address(address)?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| ReplyError::Connect(format!("{address}: {e}")))?;
        stream
            .set_write_timeout(Some(self.send_timeout))
            .map_err(|e| ReplyError::Connect(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        Ok(Box::new(TcpReplyConnection {
            stream,
            broken: false,
        }))
    }
}

struct TcpReplyConnection {
    stream: TcpStream,
    broken: bool,
}

impl ReplyConnection for TcpReplyConnection {
    fn send(&mut self, frame: &[u8]) -> Result<(), ReplyError> {
        let written = self.stream.write_all(frame).and_then(|_| self.stream.flush());
        written.map_err(|e| {
            self.broken = true;
            ReplyError::Send(e.to_string())
        })
    }

    fn is_connected(&self) -> bool {
        if self.broken || self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        // Callers never write back on a reply connection, so readable bytes
        // or EOF both mean the peer is done with it.
        let mut probe = [0u8; 1];
        let alive = matches!(self.stream.peek(&mut probe), Err(e) if e.kind() == ErrorKind::WouldBlock);
        let _ = self.stream.set_nonblocking(false);
        alive
    }
}

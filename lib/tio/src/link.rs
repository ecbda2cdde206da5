//! Error and status plumbing shared by all transports.

use crate::packet::FrameError;
use std::io;
use thiserror::Error;

pub type LinkResult<T> = Result<T, LinkError>;

/// Outcome of a successful send: the packet either left entirely or part
/// of it remains buffered in the transport (writable readiness will flush
/// it).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Buffered,
}

/// Recoverable protocol-level damage on a link. The connection survives;
/// the transport resynchronises and the caller decides whether to log.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("frame checksum mismatch (expected {expected:08x}, found {found:08x})")]
    Crc { expected: u32, found: u32 },
    #[error("websocket framing: {0}")]
    WsFrame(&'static str),
    #[error("serial framing: {0}")]
    Slip(&'static str),
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
}

#[derive(Debug, Error)]
pub enum LinkError {
    /// No complete packet available right now; wait for readiness.
    #[error("operation would block")]
    Wait,
    /// The packet does not fit in the transmit buffer. Fatal for clients,
    /// a dropped packet for sensors.
    #[error("transmit buffer overflow")]
    Overflow,
    /// Damaged frame; the link itself is still usable.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// Unrecoverable transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// True for error kinds that mean "try again when ready" rather than a
/// dead link. Serial ports surface their zero-timeout reads as `TimedOut`.
pub fn is_wouldblock(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

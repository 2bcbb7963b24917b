use std::io;
use thiserror::Error;

/// Errors surfaced by [crate::tcp_datagram_socket::TcpDatagramSocket].
///
/// Per-peer failures (protocol mismatches, corrupted streams, broken outbound connections) are
///  deliberately absent: they are logged and the affected connection is dropped, the same way
///  a lost UDP datagram is invisible to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind listening endpoint: {0}")]
    Bind(#[source] io::Error),

    #[error("already bound")]
    AlreadyBound,

    #[error("receive timed out")]
    Timeout,

    #[error("closed socket")]
    Closed,

    #[error("packet length {len} exceeds {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("packet length {len} is shorter than the frame header")]
    PacketTooShort { len: usize },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid value for option {0}")]
    InvalidOption(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// `true` for errors after which the caller may simply call `receive()` again
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

//! Transport error types.

use mbtcp_protocol::{ModbusException, ProtocolError};
use std::net::SocketAddrV4;
use thiserror::Error;

/// Errors surfaced by socket and connection operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {addr}: {source}")]
    ConnectionEstablishment {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for data")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message id: expected {expected}, received {received}")]
    InvalidMessageId { expected: u16, received: u16 },

    #[error("{0}")]
    Exception(#[from] ModbusException),
}

impl TransportError {
    /// Returns whether repeating the exchange with a fresh transaction id
    /// may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::InvalidMessageId { .. } => true,
            TransportError::Exception(ex) => ex.code.is_transient(),
            _ => false,
        }
    }

    /// OS error code behind a failed connect, if any.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            TransportError::ConnectionEstablishment { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// The exception signaled by the peer, if this is one.
    pub fn exception(&self) -> Option<&ModbusException> {
        match self {
            TransportError::Exception(ex) => Some(ex),
            _ => None,
        }
    }
}

//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or parsing Modbus TCP data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: need {needed} bytes, got {actual}")]
    FrameTooShort { needed: usize, actual: usize },

    #[error("invalid protocol id: expected 0, got {0}")]
    InvalidProtocolId(u16),

    #[error("length mismatch: header declares {declared} bytes, {actual} available")]
    LengthMismatch { declared: u16, actual: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

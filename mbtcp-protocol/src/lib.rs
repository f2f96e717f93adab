//! # mbtcp-protocol
//!
//! Wire protocol implementation for Modbus over TCP.
//!
//! This crate provides:
//! - MBAP framing (transaction id, protocol id, length prefix)
//! - The PDU codec contract consumed by the transport
//! - Exception PDUs and Modbus exception codes
//! - Protocol constants

pub mod error;
pub mod frame;
pub mod pdu;

pub use error::ProtocolError;
pub use frame::{Frame, MbapHeader, MBAP_HEADER_SIZE};
pub use pdu::{ExceptionCode, ModbusException, Pdu, RawPdu};

/// Protocol identifier carried by every Modbus TCP frame.
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Registered Modbus TCP port.
pub const DEFAULT_PORT: u16 = 502;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

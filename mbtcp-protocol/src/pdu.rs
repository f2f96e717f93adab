//! PDU codec contract and the exception PDU.
//!
//! The transport treats PDUs as opaque: anything implementing [`Pdu`] can be
//! sent or awaited. Payloads start with the unit identifier followed by the
//! function code; exception replies set the high bit of the function code.

use crate::error::ProtocolError;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Serialization contract between the transport and a PDU codec.
pub trait Pdu: Sized {
    /// Serializes the PDU into payload bytes.
    fn to_bytes(&self) -> Bytes;

    /// Parses a PDU from payload bytes.
    fn from_bytes(bytes: Bytes) -> Result<Self, ProtocolError>;
}

/// An uninterpreted PDU payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPdu(Bytes);

impl RawPdu {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Unit identifier (first payload byte), if present.
    pub fn unit_id(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Function code (second payload byte), if present.
    pub fn function_code(&self) -> Option<u8> {
        self.0.get(1).copied()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Pdu for RawPdu {
    fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    fn from_bytes(bytes: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self(bytes))
    }
}

impl From<Vec<u8>> for RawPdu {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for RawPdu {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    /// A code outside the standard table, kept verbatim.
    Other(u8),
}

impl ExceptionCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::NegativeAcknowledge => 0x07,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Other(code) => *code,
        }
    }

    /// Returns whether the device is asking the caller to try again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExceptionCode::Acknowledge | ExceptionCode::ServerDeviceBusy
        )
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x07 => ExceptionCode::NegativeAcknowledge,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionCode::IllegalFunction => write!(f, "ILLEGAL_FUNCTION"),
            ExceptionCode::IllegalDataAddress => write!(f, "ILLEGAL_DATA_ADDRESS"),
            ExceptionCode::IllegalDataValue => write!(f, "ILLEGAL_DATA_VALUE"),
            ExceptionCode::ServerDeviceFailure => write!(f, "SERVER_DEVICE_FAILURE"),
            ExceptionCode::Acknowledge => write!(f, "ACKNOWLEDGE"),
            ExceptionCode::ServerDeviceBusy => write!(f, "SERVER_DEVICE_BUSY"),
            ExceptionCode::NegativeAcknowledge => write!(f, "NEGATIVE_ACKNOWLEDGE"),
            ExceptionCode::MemoryParityError => write!(f, "MEMORY_PARITY_ERROR"),
            ExceptionCode::GatewayPathUnavailable => write!(f, "GATEWAY_PATH_UNAVAILABLE"),
            ExceptionCode::GatewayTargetFailedToRespond => {
                write!(f, "GATEWAY_TARGET_FAILED_TO_RESPOND")
            }
            ExceptionCode::Other(code) => write!(f, "UNKNOWN({code:#04x})"),
        }
    }
}

/// An exception reply signaled by the remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("modbus exception {code} (function {function_code:#04x}, unit {unit_id})")]
pub struct ModbusException {
    pub unit_id: u8,
    /// Function code of the rejected request, without the error flag.
    pub function_code: u8,
    pub code: ExceptionCode,
}

impl ModbusException {
    /// High bit set on the function code of exception replies.
    pub const ERROR_FLAG: u8 = 0x80;

    /// Encoded size: unit id, flagged function code, exception code.
    pub const ENCODED_LEN: usize = 3;

    pub fn new(unit_id: u8, function_code: u8, code: ExceptionCode) -> Self {
        Self {
            unit_id,
            function_code: function_code & !Self::ERROR_FLAG,
            code,
        }
    }

    /// Builds the exception answering `request`.
    pub fn for_request(request: &RawPdu, code: ExceptionCode) -> Self {
        Self::new(
            request.unit_id().unwrap_or_default(),
            request.function_code().unwrap_or_default(),
            code,
        )
    }

    /// Returns whether `bytes` encode an exception reply rather than a
    /// normal response.
    pub fn is_present_in(bytes: &[u8]) -> bool {
        bytes
            .get(1)
            .is_some_and(|function_code| function_code & Self::ERROR_FLAG != 0)
    }
}

impl Pdu for ModbusException {
    fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&[
            self.unit_id,
            self.function_code | Self::ERROR_FLAG,
            self.code.as_u8(),
        ])
    }

    fn from_bytes(bytes: Bytes) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(ProtocolError::MalformedPdu(format!(
                "exception PDU must be {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        if !Self::is_present_in(&bytes) {
            return Err(ProtocolError::MalformedPdu(format!(
                "function code {:#04x} has no exception flag",
                bytes[1]
            )));
        }

        Ok(Self::new(bytes[0], bytes[1], ExceptionCode::from(bytes[2])))
    }
}

//! MBAP frame format for Modbus TCP.
//!
//! Frame layout (6 bytes header + payload), all fields big-endian:
//!
//! ```text
//! +----------------+-------------+---------+---------------------+
//! | transaction_id | protocol_id | length  | payload             |
//! |    2 bytes     |   2 bytes   | 2 bytes | length bytes (PDU)  |
//! +----------------+-------------+---------+---------------------+
//! ```
//!
//! The unit identifier is not part of this header; PDU codecs that need one
//! carry it as the first payload byte.

use crate::error::ProtocolError;
use crate::{MAX_PAYLOAD_SIZE, MODBUS_PROTOCOL_ID};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the MBAP header in bytes (2+2+2 = 6).
pub const MBAP_HEADER_SIZE: usize = 6;

/// A parsed MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Correlation id chosen by the request initiator.
    pub transaction_id: u16,
    /// Always [`MODBUS_PROTOCOL_ID`] once decoded.
    pub protocol_id: u16,
    /// Number of payload bytes following the header.
    pub length: u16,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length,
        }
    }

    /// Writes the header into `buf`.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
    }

    /// Parses and validates the first [`MBAP_HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Bytes past the header are ignored, so this can be used on a bare
    /// header before the payload has been read.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < MBAP_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                needed: MBAP_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut cursor = &bytes[..MBAP_HEADER_SIZE];
        let transaction_id = cursor.get_u16();
        let protocol_id = cursor.get_u16();
        if protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ProtocolError::InvalidProtocolId(protocol_id));
        }
        let length = cursor.get_u16();

        Ok(Self {
            transaction_id,
            protocol_id,
            length,
        })
    }

    /// Total frame size declared by a raw header, without validating it.
    ///
    /// Lets a reader consume a whole frame before rejecting it, so a bad
    /// header does not leave payload bytes on the stream.
    pub fn declared_frame_len(header: &[u8; MBAP_HEADER_SIZE]) -> usize {
        MBAP_HEADER_SIZE + u16::from_be_bytes([header[4], header[5]]) as usize
    }

    /// Payload length as a buffer size.
    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    /// Total frame size (header + payload).
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_SIZE + self.payload_len()
    }
}

/// A Modbus TCP frame: a transaction id wrapping an opaque PDU payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transaction id carried in the header.
    pub transaction_id: u16,
    /// PDU bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(transaction_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            transaction_id,
            payload: payload.into(),
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(MBAP_HEADER_SIZE + payload_len);
        MbapHeader::new(self.transaction_id, payload_len as u16).put(&mut buf);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes one complete frame.
    ///
    /// `frame` must hold exactly one frame: the declared length has to match
    /// the number of bytes after the header.
    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        let header = MbapHeader::decode(&frame)?;
        frame.advance(MBAP_HEADER_SIZE);

        if frame.len() != header.payload_len() {
            return Err(ProtocolError::LengthMismatch {
                declared: header.length,
                actual: frame.len(),
            });
        }

        Ok(Self {
            transaction_id: header.transaction_id,
            payload: frame,
        })
    }
}

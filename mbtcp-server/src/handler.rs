//! Request handlers.

use mbtcp_protocol::{ModbusException, RawPdu};

/// Answers one request PDU, either with a response PDU or an exception.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: RawPdu) -> Result<RawPdu, ModbusException>;
}

impl<F> RequestHandler for F
where
    F: Fn(RawPdu) -> Result<RawPdu, ModbusException> + Send + Sync,
{
    fn handle(&self, request: RawPdu) -> Result<RawPdu, ModbusException> {
        self(request)
    }
}

/// Replies to every request with the request itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, request: RawPdu) -> Result<RawPdu, ModbusException> {
        Ok(request)
    }
}

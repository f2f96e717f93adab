//! Owned socket handle.
//!
//! A [`SocketHandle`] is either closed or open with exactly one TCP stream.
//! Closing is idempotent and happens on drop, so overwriting a handle
//! releases the stream it held. [`SocketHandle::take`] moves the stream out
//! and leaves the source closed.

use crate::config::ConnectionConfig;
use crate::error::TransportError;
use mbtcp_protocol::ProtocolError;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::time::Instant;

#[derive(Debug, Default)]
enum SocketState {
    #[default]
    Closed,
    Open(TcpStream),
}

/// Exclusive owner of one TCP stream.
#[derive(Debug, Default)]
pub struct SocketHandle {
    state: SocketState,
}

impl SocketHandle {
    /// Connects to `address:port`. `address` must be a numeric IPv4 literal.
    pub fn connect(
        address: &str,
        port: u16,
        config: &ConnectionConfig,
    ) -> Result<Self, TransportError> {
        let ip: Ipv4Addr = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        let addr = SocketAddrV4::new(ip, port);

        tracing::debug!("Connecting to {}...", addr);
        let result = match config.connect_timeout() {
            Some(timeout) => TcpStream::connect_timeout(&SocketAddr::V4(addr), timeout),
            None => TcpStream::connect(addr),
        };
        let stream = result.map_err(|source| {
            tracing::debug!("Connection to {} failed: {}", addr, source);
            TransportError::ConnectionEstablishment { addr, source }
        })?;

        if config.nodelay {
            stream.set_nodelay(true).ok();
        }

        tracing::debug!("TCP connected to {}", addr);
        Ok(Self::from_stream(stream))
    }

    /// Adopts an already-connected stream (e.g. one returned by `accept`).
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            state: SocketState::Open(stream),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SocketState::Open(_))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            SocketState::Open(stream) => stream.peer_addr().ok(),
            SocketState::Closed => None,
        }
    }

    /// Moves the stream out, leaving this handle closed.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Shuts the stream down. Calling this on a closed handle does nothing.
    pub fn close(&mut self) {
        if let SocketState::Open(stream) = std::mem::take(&mut self.state) {
            tracing::debug!("Closing socket (peer {:?})", stream.peer_addr().ok());
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        match &mut self.state {
            SocketState::Open(stream) => Ok(stream),
            SocketState::Closed => Err(TransportError::NotConnected),
        }
    }

    /// Writes all of `bytes` to the stream.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Fills `buf` from the stream, looping over partial reads, until
    /// `deadline`.
    ///
    /// Expiry maps to `Timeout`, a zero-byte read to `ConnectionClosed`, and a
    /// failed read to `Protocol(Io)`.
    pub fn read_exact_until(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<(), TransportError> {
        let stream = self.stream()?;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            stream.set_read_timeout(Some(remaining))?;

            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::ConnectionClosed),
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Io(e).into()),
            }
        }

        Ok(())
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.close();
    }
}

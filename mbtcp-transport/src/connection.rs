//! Connection management.
//!
//! A [`Connection`] frames PDUs with an MBAP header and exchanges them over
//! one owned socket. It tracks a single transaction id, so callers must
//! observe a response (or a failure) before sending the next request.

use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::socket::SocketHandle;
use bytes::{Bytes, BytesMut};
use mbtcp_protocol::{Frame, MbapHeader, ModbusException, Pdu, MBAP_HEADER_SIZE};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// A Modbus TCP connection, usable in client or server role.
#[derive(Debug, Default)]
pub struct Connection {
    socket: SocketHandle,
    config: ConnectionConfig,
    /// Id of the last request sent (client) or received (server).
    transaction_id: u16,
    /// Id the next `send_request` will use.
    next_transaction_id: u16,
}

impl Connection {
    /// Connects to `address:port` with the default configuration.
    pub fn connect(address: &str, port: u16) -> Result<Self, TransportError> {
        Self::connect_with_config(address, port, ConnectionConfig::default())
    }

    /// Connects to `address:port`. `address` must be a numeric IPv4 literal.
    pub fn connect_with_config(
        address: &str,
        port: u16,
        config: ConnectionConfig,
    ) -> Result<Self, TransportError> {
        let socket = SocketHandle::connect(address, port, &config)?;
        Ok(Self::with_socket(socket, config))
    }

    /// Adopts an accepted stream (server role).
    pub fn from_stream(stream: TcpStream) -> Self {
        Self::from_stream_with_config(stream, ConnectionConfig::default())
    }

    pub fn from_stream_with_config(stream: TcpStream, config: ConnectionConfig) -> Self {
        if config.nodelay {
            stream.set_nodelay(true).ok();
        }
        Self::with_socket(SocketHandle::from_stream(stream), config)
    }

    fn with_socket(socket: SocketHandle, config: ConnectionConfig) -> Self {
        Self {
            socket,
            config,
            transaction_id: 0,
            next_transaction_id: 0,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn response_timeout(&self) -> Duration {
        self.config.response_timeout()
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.config = self.config.clone().with_response_timeout(timeout);
    }

    /// Id of the last request sent (client) or received (server).
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Overrides the id echoed by `send_response` and `send_exception`
    /// and expected by `await_response`.
    pub fn set_transaction_id(&mut self, transaction_id: u16) {
        self.transaction_id = transaction_id;
    }

    pub fn next_transaction_id(&self) -> u16 {
        self.next_transaction_id
    }

    pub fn set_next_transaction_id(&mut self, transaction_id: u16) {
        self.next_transaction_id = transaction_id;
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Closes the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.socket.close();
    }

    /// Moves the connection out, leaving `self` closed.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Sends `pdu` as a new request and returns the bytes written.
    pub fn send_request<P: Pdu>(&mut self, pdu: &P) -> Result<Bytes, TransportError> {
        let transaction_id = self.next_transaction_id;
        let sent = self.send_frame(transaction_id, pdu.to_bytes())?;

        self.next_transaction_id = transaction_id.wrapping_add(1);
        self.transaction_id = transaction_id;
        Ok(sent)
    }

    /// Sends `pdu` as the response to the last received request.
    pub fn send_response<P: Pdu>(&mut self, pdu: &P) -> Result<Bytes, TransportError> {
        self.send_frame(self.transaction_id, pdu.to_bytes())
    }

    /// Sends `exception` as the reply to the last received request.
    pub fn send_exception(
        &mut self,
        exception: &ModbusException,
    ) -> Result<Bytes, TransportError> {
        self.send_frame(self.transaction_id, exception.to_bytes())
    }

    fn send_frame(
        &mut self,
        transaction_id: u16,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        let encoded = Frame::new(transaction_id, payload).encode()?.freeze();
        self.socket.write_all(&encoded)?;
        tracing::debug!(
            "Sent frame tid={} ({} bytes)",
            transaction_id,
            encoded.len()
        );
        Ok(encoded)
    }

    /// Waits for one complete frame and returns it undecoded, header
    /// included.
    pub fn await_raw_message(&mut self) -> Result<Bytes, TransportError> {
        self.read_frame(self.config.liveness_timeout())
    }

    /// Waits for a request and remembers its transaction id for the reply.
    pub fn await_request<P: Pdu>(&mut self) -> Result<P, TransportError> {
        let frame = Frame::decode(self.read_frame(self.config.request_timeout())?)?;
        self.transaction_id = frame.transaction_id;
        Ok(P::from_bytes(frame.payload)?)
    }

    /// Waits for the response to the last request.
    ///
    /// A frame carrying another transaction id fails with
    /// `InvalidMessageId`; an exception payload fails with `Exception`.
    pub fn await_response<P: Pdu>(&mut self) -> Result<P, TransportError> {
        let frame = Frame::decode(self.read_frame(self.config.response_timeout())?)?;

        if frame.transaction_id != self.transaction_id {
            tracing::warn!(
                "Response tid={} does not match request tid={}",
                frame.transaction_id,
                self.transaction_id
            );
            return Err(TransportError::InvalidMessageId {
                expected: self.transaction_id,
                received: frame.transaction_id,
            });
        }

        if ModbusException::is_present_in(&frame.payload) {
            let exception = ModbusException::from_bytes(frame.payload)?;
            tracing::debug!(
                "Response tid={} is an exception: {}",
                frame.transaction_id,
                exception
            );
            return Err(TransportError::Exception(exception));
        }

        Ok(P::from_bytes(frame.payload)?)
    }

    /// Sends `pdu` and waits for its response.
    pub fn request<Req: Pdu, Resp: Pdu>(&mut self, pdu: &Req) -> Result<Resp, TransportError> {
        self.send_request(pdu)?;
        self.await_response()
    }

    /// Reads exactly one frame: the fixed header first, then the payload
    /// length it declares. One deadline covers both reads.
    ///
    /// The header is validated only once the whole frame is in, so a
    /// rejected frame is fully consumed and the next read starts on a frame
    /// boundary.
    fn read_frame(&mut self, wait: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + wait;

        let mut header_buf = [0u8; MBAP_HEADER_SIZE];
        self.socket.read_exact_until(&mut header_buf, deadline)?;

        let mut buf = BytesMut::zeroed(MbapHeader::declared_frame_len(&header_buf));
        buf[..MBAP_HEADER_SIZE].copy_from_slice(&header_buf);
        self.socket
            .read_exact_until(&mut buf[MBAP_HEADER_SIZE..], deadline)?;

        let header = MbapHeader::decode(&buf).map_err(|e| {
            tracing::warn!("Rejected frame header {:02x?}: {}", header_buf, e);
            e
        })?;

        tracing::debug!(
            "Received frame tid={} ({} bytes)",
            header.transaction_id,
            buf.len()
        );
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbtcp_protocol::{ExceptionCode, ProtocolError, RawPdu};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::new()
            .with_response_timeout(Duration::from_millis(200))
            .with_request_timeout(Duration::from_millis(200))
            .with_liveness_timeout(Duration::from_millis(200))
    }

    /// Client connection plus the raw accepted stream on the other side.
    fn client_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = Connection::connect_with_config("127.0.0.1", port, test_config()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (conn, peer)
    }

    /// Server-role connection adopted from `accept`, plus a raw client stream.
    fn server_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (
            Connection::from_stream_with_config(accepted, test_config()),
            client,
        )
    }

    fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Fails the test if the PDU codec is ever asked to parse a payload.
    struct MustNotDecode;

    static DECODE_CALLS: AtomicUsize = AtomicUsize::new(0);

    impl Pdu for MustNotDecode {
        fn to_bytes(&self) -> Bytes {
            Bytes::new()
        }

        fn from_bytes(_bytes: Bytes) -> Result<Self, ProtocolError> {
            DECODE_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(Self)
        }
    }

    #[test]
    fn test_end_to_end_exchange() {
        let (mut conn, mut peer) = client_pair();
        conn.set_next_transaction_id(5);

        let sent = conn.send_request(&RawPdu::from(vec![0x01, 0x02])).unwrap();
        assert_eq!(
            sent.as_ref(),
            &[0x00, 0x05, 0x00, 0x00, 0x00, 0x02, 0x01, 0x02]
        );
        assert_eq!(read_n(&mut peer, 8), sent.to_vec());

        peer.write_all(&[0x00, 0x05, 0x00, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03])
            .unwrap();
        let response: RawPdu = conn.await_response().unwrap();
        assert_eq!(response.as_bytes(), &[0x01, 0x02, 0x03]);
        assert_eq!(conn.transaction_id(), 5);
        assert_eq!(conn.next_transaction_id(), 6);
    }

    #[test]
    fn test_transaction_id_wraps() {
        let (mut conn, mut peer) = client_pair();
        conn.set_next_transaction_id(u16::MAX);

        conn.send_request(&RawPdu::from(vec![0x01])).unwrap();
        assert_eq!(conn.transaction_id(), u16::MAX);
        assert_eq!(conn.next_transaction_id(), 0);

        let sent = conn.send_request(&RawPdu::from(vec![0x01])).unwrap();
        assert_eq!(&sent[..2], &[0x00, 0x00]);

        let wire = read_n(&mut peer, 14);
        assert_eq!(&wire[..2], &[0xFF, 0xFF]);
        assert_eq!(&wire[7..9], &[0x00, 0x00]);
    }

    #[test]
    fn test_mismatched_transaction_id() {
        let (mut conn, mut peer) = client_pair();
        conn.set_next_transaction_id(5);
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();

        let before = DECODE_CALLS.load(Ordering::SeqCst);
        peer.write_all(&[0x00, 0x06, 0x00, 0x00, 0x00, 0x03, 0x01, 0x03, 0x00])
            .unwrap();
        let result = conn.await_response::<MustNotDecode>();
        assert!(matches!(
            result,
            Err(TransportError::InvalidMessageId {
                expected: 5,
                received: 6
            })
        ));
        assert_eq!(DECODE_CALLS.load(Ordering::SeqCst), before);
        assert!(conn.is_open());
    }

    #[test]
    fn test_exception_takes_precedence() {
        let (mut conn, mut peer) = client_pair();
        conn.send_request(&RawPdu::from(vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01]))
            .unwrap();

        peer.write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02])
            .unwrap();
        let err = conn.await_response::<RawPdu>().unwrap_err();
        let exception = err.exception().copied().unwrap();
        assert_eq!(exception.unit_id, 0x01);
        assert_eq!(exception.function_code, 0x03);
        assert_eq!(exception.code, ExceptionCode::IllegalDataAddress);
    }

    #[test]
    fn test_response_timeout() {
        let (mut conn, _peer) = client_pair();
        conn.set_response_timeout(Duration::from_millis(100));
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();

        let started = Instant::now();
        let result = conn.await_response::<RawPdu>();
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(conn.is_open());
    }

    #[test]
    fn test_partial_payload_times_out() {
        let (mut conn, mut peer) = client_pair();
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();

        // Header promises 4 bytes, only 1 arrives.
        peer.write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01])
            .unwrap();
        let result = conn.await_response::<RawPdu>();
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[test]
    fn test_closed_peer() {
        let (mut conn, mut peer) = client_pair();
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();
        read_n(&mut peer, 8);
        drop(peer);

        let result = conn.await_response::<RawPdu>();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn test_reset_peer_is_read_failure() {
        let (mut conn, peer) = client_pair();
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();
        // Closing with the request still unread makes the kernel send RST.
        std::thread::sleep(Duration::from_millis(20));
        drop(peer);

        let result = conn.await_response::<RawPdu>();
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::Io(_)))
        ));
    }

    #[test]
    fn test_invalid_protocol_id_rejected() {
        let (mut conn, mut peer) = client_pair();
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();

        peer.write_all(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01])
            .unwrap();
        let result = conn.await_response::<RawPdu>();
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::InvalidProtocolId(1)))
        ));
    }

    #[test]
    fn test_rejected_header_keeps_stream_in_sync() {
        let (mut conn, mut peer) = client_pair();
        conn.set_next_transaction_id(1);
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();

        peer.write_all(&[0x00, 0x01, 0x00, 0x07, 0x00, 0x03, 0xAA, 0xBB, 0xCC])
            .unwrap();
        let result = conn.await_response::<RawPdu>();
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::InvalidProtocolId(7)))
        ));

        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();
        peer.write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03])
            .unwrap();
        let response: RawPdu = conn.await_response().unwrap();
        assert_eq!(response.as_bytes(), &[0x01, 0x03]);
        assert_eq!(conn.transaction_id(), 2);
    }

    #[test]
    fn test_raw_message_rejects_bad_header_whole() {
        let (mut conn, mut peer) = server_pair();
        peer.write_all(&[
            0x00, 0x03, 0x00, 0x09, 0x00, 0x02, 0x01, 0x04, // protocol id 9
            0x00, 0x04, 0x00, 0x00, 0x00, 0x02, 0x01, 0x05,
        ])
        .unwrap();

        let result = conn.await_raw_message();
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::InvalidProtocolId(9)))
        ));

        let raw = conn.await_raw_message().unwrap();
        assert_eq!(raw.as_ref(), &[0x00, 0x04, 0x00, 0x00, 0x00, 0x02, 0x01, 0x05]);
    }

    #[test]
    fn test_frame_split_across_writes() {
        let (mut conn, mut peer) = client_pair();
        conn.set_next_transaction_id(0x0102);
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();

        let writer = std::thread::spawn(move || {
            let frame = [0x01u8, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0xAB, 0xCD];
            for byte in frame {
                peer.write_all(&[byte]).unwrap();
                peer.flush().unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
            peer
        });

        let response: RawPdu = conn.await_response().unwrap();
        assert_eq!(response.as_bytes(), &[0x01, 0x03, 0x02, 0xAB, 0xCD]);
        writer.join().unwrap();
    }

    #[test]
    fn test_back_to_back_frames() {
        let (mut conn, mut peer) = server_pair();
        peer.write_all(&[
            0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x01, 0x11, // tid 7
            0x00, 0x08, 0x00, 0x00, 0x00, 0x02, 0x01, 0x22, // tid 8
        ])
        .unwrap();

        let first: RawPdu = conn.await_request().unwrap();
        assert_eq!(first.function_code(), Some(0x11));
        assert_eq!(conn.transaction_id(), 7);

        let second: RawPdu = conn.await_request().unwrap();
        assert_eq!(second.function_code(), Some(0x22));
        assert_eq!(conn.transaction_id(), 8);
    }

    #[test]
    fn test_server_echoes_request_id() {
        let (mut conn, mut peer) = server_pair();
        peer.write_all(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03])
            .unwrap();

        let request: RawPdu = conn.await_request().unwrap();
        assert_eq!(conn.transaction_id(), 0x1234);

        let sent = conn.send_response(&request).unwrap();
        assert_eq!(&sent[..2], &[0x12, 0x34]);
        assert_eq!(read_n(&mut peer, 8), sent.to_vec());

        let exception = ModbusException::for_request(&request, ExceptionCode::IllegalFunction);
        let sent = conn.send_exception(&exception).unwrap();
        assert_eq!(
            sent.as_ref(),
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x01]
        );
        // No new id is allocated by replies.
        assert_eq!(conn.next_transaction_id(), 0);
    }

    #[test]
    fn test_await_request_timeout() {
        let (mut conn, _peer) = server_pair();
        let result = conn.await_request::<RawPdu>();
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[test]
    fn test_await_raw_message() {
        let (mut conn, mut peer) = server_pair();
        let frame = [0x00, 0x09, 0x00, 0x00, 0x00, 0x02, 0x01, 0x04];
        peer.write_all(&frame).unwrap();

        let raw = conn.await_raw_message().unwrap();
        assert_eq!(raw.as_ref(), &frame);
        // Raw reads leave correlation state alone.
        assert_eq!(conn.transaction_id(), 0);

        drop(peer);
        let result = conn.await_raw_message();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn test_request_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Connection::from_stream(stream);
            let request: RawPdu = conn.await_request().unwrap();
            conn.send_response(&request).unwrap();
        });

        let mut client = Connection::connect("127.0.0.1", port).unwrap();
        client.set_next_transaction_id(41);
        let response: RawPdu = client
            .request(&RawPdu::from(vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03]))
            .unwrap();
        assert_eq!(response.as_bytes(), &[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        assert_eq!(client.transaction_id(), 41);
        server.join().unwrap();
    }

    #[test]
    fn test_failure_leaves_connection_reusable() {
        let (mut conn, mut peer) = client_pair();
        conn.set_next_transaction_id(1);
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();
        assert!(matches!(
            conn.await_response::<RawPdu>(),
            Err(TransportError::Timeout)
        ));

        // Late reply to tid 1 is drained as a mismatch once tid 2 is pending.
        conn.send_request(&RawPdu::from(vec![0x01, 0x03])).unwrap();
        peer.write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03])
            .unwrap();
        assert!(matches!(
            conn.await_response::<RawPdu>(),
            Err(TransportError::InvalidMessageId {
                expected: 2,
                received: 1
            })
        ));

        peer.write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03])
            .unwrap();
        let response: RawPdu = conn.await_response().unwrap();
        assert_eq!(response.function_code(), Some(0x03));
    }

    #[test]
    fn test_take_transfers_socket() {
        let (mut conn, mut peer) = client_pair();
        conn.set_next_transaction_id(3);

        let mut moved = conn.take();
        assert!(!conn.is_open());
        assert!(moved.is_open());
        assert_eq!(moved.next_transaction_id(), 3);

        drop(conn);
        moved.send_request(&RawPdu::from(vec![0x01])).unwrap();
        assert_eq!(read_n(&mut peer, 7), vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_closed_connection_rejects_io() {
        let (mut conn, _peer) = client_pair();
        conn.close();
        conn.close();

        let result = conn.send_request(&RawPdu::from(vec![0x01]));
        assert!(matches!(result, Err(TransportError::NotConnected)));
        let result = conn.await_response::<RawPdu>();
        assert!(matches!(result, Err(TransportError::NotConnected)));
        // A failed send does not consume an id.
        assert_eq!(conn.next_transaction_id(), 0);
    }

    #[test]
    fn test_default_connection_is_closed() {
        let mut conn = Connection::default();
        assert!(!conn.is_open());
        assert!(conn.peer_addr().is_none());
        assert_eq!(conn.response_timeout(), Duration::from_millis(500));
        assert!(matches!(
            conn.await_raw_message(),
            Err(TransportError::NotConnected)
        ));
    }
}

//! Blocking TCP server.
//!
//! The accept loop polls a non-blocking listener so `shutdown()` is noticed
//! promptly. Each accepted socket is switched back to blocking mode, adopted
//! into a [`Connection`] and served on its own thread.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::RequestHandler;
use mbtcp_protocol::RawPdu;
use mbtcp_transport::{Connection, TransportError};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sleep between accept attempts when no client is waiting.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub exceptions_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Modbus TCP responder.
pub struct Server {
    listener: TcpListener,
    config: Config,
    handler: Arc<dyn RequestHandler>,
    stats: Arc<ServerStats>,
    shutdown: Arc<AtomicBool>,
    running: AtomicBool,
}

impl Server {
    /// Binds the listener described by `config`.
    pub fn bind<H>(config: Config, handler: H) -> Result<Self, ServerError>
    where
        H: RequestHandler + 'static,
    {
        config.validate()?;
        let listener = TcpListener::bind(config.network.bind_addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            config,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until `shutdown()` is called.
    pub fn run(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        tracing::info!("Server listening on {}", self.local_addr()?);

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => self.spawn_session(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        tracing::info!("Server shutting down");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.network.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            return;
        }

        if let Err(e) = stream.set_nonblocking(false) {
            tracing::warn!("[{}] Cannot switch socket to blocking mode: {}", addr, e);
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let conn = Connection::from_stream_with_config(stream, self.config.connection.clone());
        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();

        let spawned = thread::Builder::new()
            .name(format!("mbtcp-session-{}", addr))
            .spawn(move || {
                let result = serve_connection(conn, addr, handler.as_ref(), &stats, &shutdown);

                if let Err(e) = result {
                    tracing::debug!("Connection {} error: {}", addr, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                tracing::info!("Client disconnected: {}", addr);
            });

        if let Err(e) = spawned {
            tracing::error!("[{}] Cannot spawn session thread: {}", addr, e);
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Stops the accept loop. Open sessions end after their current wait.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Serves request/response exchanges until the peer leaves, the session
/// idles out, or the server shuts down.
fn serve_connection(
    mut conn: Connection,
    addr: SocketAddr,
    handler: &dyn RequestHandler,
    stats: &ServerStats,
    shutdown: &AtomicBool,
) -> Result<(), ServerError> {
    tracing::info!("Client connected: {}", addr);

    while !shutdown.load(Ordering::SeqCst) {
        let request: RawPdu = match conn.await_request() {
            Ok(request) => request,
            Err(TransportError::ConnectionClosed) => {
                tracing::debug!("[{}] Connection closed by client", addr);
                return Ok(());
            }
            Err(TransportError::Timeout) => {
                tracing::debug!("[{}] Idle timeout", addr);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        stats.requests_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "[{}] Request tid={} function={:?}",
            addr,
            conn.transaction_id(),
            request.function_code()
        );

        match handler.handle(request) {
            Ok(response) => {
                conn.send_response(&response)?;
            }
            Err(exception) => {
                stats.exceptions_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("[{}] Replying with {}", addr, exception);
                conn.send_exception(&exception)?;
            }
        }
    }

    Ok(())
}

//! # mbtcp-transport
//!
//! Blocking Modbus TCP transport.
//!
//! This crate provides:
//! - An owned socket handle with idempotent close
//! - `Connection`: framed send/receive for client and server roles
//! - Transaction id allocation and response correlation
//! - Deadline-bounded, length-driven frame reads
//! - Classified transport errors

pub mod config;
pub mod connection;
pub mod error;
pub mod socket;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::TransportError;
pub use socket::SocketHandle;

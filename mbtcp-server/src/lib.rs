//! # mbtcp-server
//!
//! Blocking Modbus TCP responder.
//!
//! This crate provides:
//! - An accept loop adopting each socket into a `Connection`
//! - One thread per connection running request/response exchanges
//! - Pluggable request handlers
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod handler;
pub mod server;

pub use config::{Config, ConfigError, NetworkConfig};
pub use error::ServerError;
pub use handler::{EchoHandler, RequestHandler};
pub use server::{Server, ServerStats};

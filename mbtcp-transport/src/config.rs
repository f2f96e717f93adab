//! Connection configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default response wait (500 ms).
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 500;

/// Default wait for an inbound request (1 minute).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60 * 1000;

/// Default wait for any inbound frame before the link is considered dead.
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 60 * 1000;

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long `await_response` waits for a reply, in milliseconds.
    pub response_timeout_ms: u64,
    /// How long `await_request` waits for a request, in milliseconds.
    pub request_timeout_ms: u64,
    /// How long `await_raw_message` waits for a frame, in milliseconds.
    pub liveness_timeout_ms: u64,
    /// Connect timeout in milliseconds (0 = OS default).
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm on connected sockets.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT_MS,
            connect_timeout_ms: 0,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Connect timeout, or `None` to leave it to the OS.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Applies `MBTCP_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_millis("MBTCP_RESPONSE_TIMEOUT_MS") {
            self.response_timeout_ms = ms;
        }

        if let Some(ms) = env_millis("MBTCP_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = ms;
        }

        if let Some(ms) = env_millis("MBTCP_LIVENESS_TIMEOUT_MS") {
            self.liveness_timeout_ms = ms;
        }

        if let Some(ms) = env_millis("MBTCP_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms;
        }

        if let Ok(nodelay) = std::env::var("MBTCP_NODELAY") {
            self.nodelay = nodelay == "1" || nodelay.to_lowercase() == "true";
        }
    }

    /// Checks that every wait has a usable bound.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("response_timeout_ms", self.response_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("liveness_timeout_ms", self.liveness_timeout_ms),
        ] {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

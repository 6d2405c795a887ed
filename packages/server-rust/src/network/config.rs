//! Network configuration types for the `Handoff` server.

use std::time::Duration;

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Per-connection settings for chat `WebSocket`s.
    pub connection: ConnectionConfig,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Upper bound on one HTTP exchange. Longer than any pipeline's own
    /// completion timeout so the pipeline answers first.
    pub request_timeout: Duration,
    /// How long `serve` waits for in-flight requests after the shutdown signal.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(110),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-connection configuration for chat `WebSocket`s.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound messages per connection.
    pub outbound_channel_capacity: usize,
    /// A connection with no inbound frame for this long is closed.
    pub idle_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

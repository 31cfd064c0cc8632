//! Listener and per-socket settings.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 lets the OS pick; `NetworkModule::start` reports the bound port.
    pub port: u16,
    pub connection: ConnectionConfig,
    /// `"*"` allows any origin.
    pub cors_origins: Vec<String>,
    /// REST requests running longer get a 408 and their rule evaluation
    /// is dropped.
    pub request_timeout: Duration,
    /// How long shutdown waits for REST requests still in flight.
    pub drain_timeout: Duration,
}

impl NetworkConfig {
    /// `host:port` as passed to the listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Limits applied to every realtime socket.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the per-socket outbound queue. An event that finds it
    /// full disconnects that client.
    pub outbound_channel_capacity: usize,
    pub ws_write_buffer_size: usize,
    pub ws_max_write_buffer_size: usize,
    /// Largest topic set one subscriptions frame may request. Larger sets
    /// are answered with an error frame and leave the current set alone.
    pub max_topics: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            ws_write_buffer_size: 128 * 1024,
            ws_max_write_buffer_size: 512 * 1024,
            max_topics: 500,
        }
    }
}

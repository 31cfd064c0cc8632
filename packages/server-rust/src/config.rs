//! Server-level configuration assembled by the binary.

use std::time::Duration;

use crate::network::NetworkConfig;

/// Everything needed to build an [`App`](crate::app::App) and serve it.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub auth: AuthConfig,
    pub realtime: RealtimeConfig,
}

/// Token signing and validation settings.
#[derive(Clone)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens.
    pub secret: String,
    /// Lifetime of issued tokens.
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

// Keeps the secret out of logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

/// Realtime dispatcher settings.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Queue capacity of each per-collection dispatch lane.
    pub lane_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self { lane_capacity: 1024 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.auth.token_ttl, Duration::from_secs(1_209_600));
        assert_eq!(config.realtime.lane_capacity, 1024);
        assert_eq!(config.network.port, 0);
    }

    #[test]
    fn debug_redacts_secret() {
        let config = AuthConfig {
            secret: "hunter2".to_string(),
            ..AuthConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}

//! Proxy manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by every session a manager creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Interface local listeners bind to
    pub bind_host: String,

    /// Upper bound for dialing the remote endpoint
    pub dial_timeout_secs: u64,

    /// Copy buffer size per direction
    pub buffer_size: usize,

    /// How many fresh ephemeral ports to try when the caller asked for port 0
    pub ephemeral_bind_attempts: u32,

    /// How long a stop waits for the accept loop to release its listener
    pub stop_timeout_secs: u64,

    /// Close already-accepted connections when their session stops.
    /// When false they drain until either peer closes.
    pub close_connections_on_stop: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            dial_timeout_secs: 10,
            buffer_size: 8192,
            ephemeral_bind_attempts: 3,
            stop_timeout_secs: 5,
            close_connections_on_stop: true,
        }
    }
}

impl ProxyConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.dial_timeout(), Duration::from_secs(10));
        assert_eq!(config.ephemeral_bind_attempts, 3);
        assert!(config.close_connections_on_stop);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"dial_timeout_secs": 2, "buffer_size": 1024}"#).unwrap();
        assert_eq!(config.dial_timeout_secs, 2);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.stop_timeout_secs, 5);
        assert_eq!(config.bind_host, "127.0.0.1");
    }
}

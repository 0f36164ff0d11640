//! Configuration file support
//!
//! Loads configuration from ~/.config/netspeed/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientDefaults,

    #[serde(default)]
    pub server: ServerDefaults,
}

/// Default settings for client mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientDefaults {
    /// Bytes requested per transfer (e.g., "1M", "512K")
    pub file_size: Option<String>,

    /// Number of parallel TCP transfers
    pub tcp_connections: Option<u32>,

    /// Number of parallel UDP transfers
    pub udp_connections: Option<u32>,

    /// Port offers are received on
    pub discovery_port: Option<u16>,

    /// Data bytes per UDP segment
    pub chunk_size: Option<usize>,

    /// UDP inactivity timeout in milliseconds
    pub udp_timeout_ms: Option<u64>,

    /// Default to JSON output
    pub json_output: Option<bool>,

    /// Log file path (e.g., "~/.config/netspeed/netspeed.log", null to disable)
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// Default settings for server mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    /// UDP request port
    pub udp_port: Option<u16>,

    /// TCP listening port
    pub tcp_port: Option<u16>,

    /// Port offers are sent to
    pub discovery_port: Option<u16>,

    /// Offer destination (e.g., "255.255.255.255", "192.168.1.255")
    pub broadcast_address: Option<String>,

    /// Delay between offers in milliseconds
    pub broadcast_interval_ms: Option<u64>,

    /// Data bytes per UDP segment
    pub chunk_size: Option<usize>,

    /// Log file path (e.g., "~/.config/netspeed/netspeed.log", null to disable)
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is missing
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("netspeed")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.client.file_size.is_none());
        assert!(config.server.tcp_port.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[client]
file_size = "10M"
tcp_connections = 4
udp_connections = 2
udp_timeout_ms = 500

[server]
tcp_port = 9000
broadcast_address = "192.168.1.255"
broadcast_interval_ms = 250
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.client.file_size, Some("10M".to_string()));
        assert_eq!(config.client.tcp_connections, Some(4));
        assert_eq!(config.client.udp_connections, Some(2));
        assert_eq!(config.client.udp_timeout_ms, Some(500));
        assert_eq!(config.server.tcp_port, Some(9000));
        assert_eq!(
            config.server.broadcast_address,
            Some("192.168.1.255".to_string())
        );
        assert!(config.server.udp_port.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str("[server]\nchunk_size = 512\n").unwrap();
        assert_eq!(config.server.chunk_size, Some(512));
        assert!(config.client.chunk_size.is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("netspeed-does-not-exist/config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(config.client.tcp_connections.is_none());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let path = std::env::temp_dir().join(format!("netspeed-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[client\ntcp_connections = ").unwrap();
        assert!(Config::load_from(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}

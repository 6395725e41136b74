//! Gateway configuration types
//!
//! Defines the main configuration structures for the Warren gateway.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default bind host
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default mixed SSH/SOCKS entrypoint port
fn default_public_port() -> u16 {
    2222
}

/// Default host the internal backends bind to (and the multiplexer dials)
fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

/// Default internal SSH port
fn default_ssh_port() -> u16 {
    2223
}

/// Default internal SOCKS5 port
fn default_socks_port() -> u16 {
    1080
}

/// Default graceful shutdown drain in seconds
fn default_shutdown_timeout() -> u64 {
    30
}

/// Default database URL
fn default_database_url() -> String {
    "sqlite://warren.db".to_string()
}

/// Default SSH server identification string
fn default_server_id() -> String {
    format!("SSH-2.0-warren_{}", env!("CARGO_PKG_VERSION"))
}

/// Default greeting+auth deadline in seconds
fn default_handshake_timeout() -> u64 {
    10
}

/// Default upstream connect deadline in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// Default DNS listen address
fn default_dns_listen() -> String {
    "0.0.0.0:53".to_string()
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Listener addresses and ports
    pub listen: ListenConfig,

    /// Account database configuration
    pub database: DatabaseConfig,

    /// SSH gateway configuration
    pub ssh: SshConfig,

    /// SOCKS5 gateway configuration
    pub socks: SocksConfig,

    /// DNS dispatcher configuration; the dispatcher is disabled when absent
    pub dns: Option<DnsConfig>,
}

/// Listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ListenConfig {
    /// Host address to bind the public entrypoint to
    pub host: String,

    /// Mixed SSH/SOCKS entrypoint port
    pub public_port: u16,

    /// Host the internal SSH and SOCKS5 servers bind to
    pub backend_host: String,

    /// Internal SSH port
    pub ssh_port: u16,

    /// Internal SOCKS5 port
    pub socks_port: u16,

    /// Seconds to wait for active connections to drain on shutdown
    pub shutdown_timeout: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            host: default_host(),
            public_port: default_public_port(),
            backend_host: default_backend_host(),
            ssh_port: default_ssh_port(),
            socks_port: default_socks_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Account database configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (sqlite)
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: default_database_url(),
        }
    }
}

/// SSH gateway configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SshConfig {
    /// Path to the PEM-encoded host key.
    ///
    /// When absent a temporary Ed25519 key is generated at startup; when
    /// present and unreadable, startup fails.
    pub host_key: Option<PathBuf>,

    /// Server identification string sent to clients
    pub server_id: String,

    /// Upstream connect deadline for forwarded channels, in seconds
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            host_key: None,
            server_id: default_server_id(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// SOCKS5 gateway configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SocksConfig {
    /// Deadline for the complete greeting and auth phase, in seconds
    pub handshake_timeout: u64,

    /// Upstream connect deadline, in seconds
    pub connect_timeout: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        SocksConfig {
            handshake_timeout: default_handshake_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// DNS dispatcher configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DnsConfig {
    /// UDP address to answer DNS queries on
    #[serde(default = "default_dns_listen")]
    pub listen: String,

    /// Zones to dispatch, matched by suffix in order
    pub domains: Vec<String>,

    /// Tunnel backend UDP addresses: either one for all zones, or one per zone
    pub backends: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_defaults() {
        let listen = ListenConfig::default();
        assert_eq!(listen.host, "0.0.0.0");
        assert_eq!(listen.public_port, 2222);
        assert_eq!(listen.backend_host, "127.0.0.1");
        assert_eq!(listen.ssh_port, 2223);
        assert_eq!(listen.socks_port, 1080);
        assert_eq!(listen.shutdown_timeout, 30);
    }

    #[test]
    fn test_ssh_defaults() {
        let ssh = SshConfig::default();
        assert!(ssh.host_key.is_none());
        assert!(ssh.server_id.starts_with("SSH-2.0-"));
        assert_eq!(ssh.connect_timeout, 10);
    }

    #[test]
    fn test_socks_defaults() {
        let socks = SocksConfig::default();
        assert_eq!(socks.handshake_timeout, 10);
        assert_eq!(socks.connect_timeout, 10);
    }
}

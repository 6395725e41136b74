//! # Warren - Multi-Protocol Tunneling Gateway
//!
//! Warren is a tunneling gateway that authenticates users against a shared
//! account database, enforces per-account traffic quotas and lifetimes, and
//! transports their traffic over SSH port forwarding or SOCKS5.
//!
//! ## Features
//!
//! - **Single Public Port**: first-byte sniffing demultiplexes SSH and
//!   SOCKS5 clients onto one TCP port
//! - **SSH Forwarding**: password-authenticated `direct-tcpip` channels,
//!   nothing interactive
//! - **SOCKS5**: RFC 1928/1929 username/password with `CONNECT`
//! - **Traffic Quotas**: per-session atomic metering with periodic and
//!   end-of-session flushes into sqlite
//! - **DNS Dispatch**: zone-matched queries forwarded verbatim to a
//!   DNS-over-tunnel backend
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use warren::config::load_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let shutdown = CancellationToken::new();
//!
//!     warren::gateway::run(config, shutdown).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! TCP client -> Multiplexer -> SSH gateway   -> target
//!                           -> SOCKS5 gateway -> target
//! DNS client -> Dispatcher  -> dnstt backend
//! ```
//!
//! The multiplexer, both gateways, and the DNS dispatcher run as parallel
//! tasks sharing an account store, a session registry, and one shutdown
//! token.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod gateway;
pub mod mux;
pub mod quota;
pub mod services;
pub mod session;
pub mod store;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{AuthError, GatewayError, Socks5Error};

/// Version of the Warren library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "warren");
    }
}

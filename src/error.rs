//! Error types for the warren gateway.
//!
//! Per-connection errors never terminate the process; startup errors
//! (listener bind, host key, route table, database) are fatal.

use std::io;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error (bad version, malformed request)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Upstream dial error
    #[error("Dial error: {0}")]
    Dial(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Authentication failure.
///
/// Credential and activity failures all collapse into [`AuthError::Rejected`]
/// so a caller (or a probing client) cannot distinguish an unknown username
/// from a wrong password, an expired account, or an exhausted quota.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Credentials rejected or account not active
    #[error("invalid username or password")]
    Rejected,

    /// The account database failed while checking credentials
    #[error("authentication backend error: {0}")]
    Backend(#[source] sqlx::Error),
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// IO error while reading the request
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Socks5Error {
    /// Reply code to send before closing, if the violation warrants one.
    ///
    /// Read failures and a bad request version close the connection without
    /// a reply.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            Socks5Error::CommandNotSupported(_) => Some(0x07),
            Socks5Error::AddressTypeNotSupported(_) | Socks5Error::InvalidDomain(_) => Some(0x08),
            Socks5Error::UnsupportedVersion(_) | Socks5Error::Io(_) => None,
            Socks5Error::NoAcceptableMethod | Socks5Error::AuthFailed => None,
        }
    }
}

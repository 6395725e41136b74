//! SOCKS5 authentication against the account store
//!
//! Implements the method negotiation of RFC 1928 restricted to
//! username/password, and the RFC 1929 sub-negotiation checked against the
//! shared account database.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::consts::*;
use crate::error::{GatewayError, Socks5Error};
use crate::store::{Account, AccountStore};

/// Negotiate username/password and authenticate against the store.
///
/// # Protocol
///
/// ```text
/// client: [ver=0x05][n][methods...]
/// server: [0x05][0x02]            (or [0x05][0xFF] and close)
/// client: [ver=0x01][ulen][user][plen][pass]
/// server: [0x01][0x00]            (or [0x01][0x01] and close)
/// ```
///
/// Returns the authenticated account. The store stamps `last_connection`.
pub async fn authenticate<S>(stream: &mut S, store: &AccountStore) -> Result<Account>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]).into());
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) {
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        return Err(Socks5Error::NoAcceptableMethod.into());
    }

    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD])
        .await?;
    stream.flush().await?;

    let mut sub_header = [0u8; 2];
    stream.read_exact(&mut sub_header).await?;

    if sub_header[0] != SOCKS5_AUTH_VERSION {
        send_status(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(GatewayError::Protocol(format!(
            "invalid auth sub-negotiation version: {}",
            sub_header[0]
        ))
        .into());
    }

    let username_len = sub_header[1] as usize;
    if username_len == 0 {
        send_status(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(GatewayError::Protocol("empty username".to_string()).into());
    }

    let mut username = vec![0u8; username_len];
    stream.read_exact(&mut username).await?;
    let Ok(username) = String::from_utf8(username) else {
        send_status(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(GatewayError::Protocol("username is not valid UTF-8".to_string()).into());
    };

    let mut len_buf = [0u8; 1];
    stream.read_exact(&mut len_buf).await?;
    let mut password = vec![0u8; len_buf[0] as usize];
    stream.read_exact(&mut password).await?;
    let Ok(password) = String::from_utf8(password) else {
        send_status(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(GatewayError::Protocol("password is not valid UTF-8".to_string()).into());
    };

    match store.authenticate(&username, &password).await {
        Ok(account) => {
            send_status(stream, SOCKS5_AUTH_SUCCESS).await?;
            debug!(username = %account.username, "socks user authenticated");
            Ok(account)
        }
        Err(err) => {
            send_status(stream, SOCKS5_AUTH_FAILURE).await?;
            info!(username = %username, error = %err, "socks authentication failed");
            Err(Socks5Error::AuthFailed.into())
        }
    }
}

/// Send the RFC 1929 status byte.
async fn send_status<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}

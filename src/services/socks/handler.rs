//! Per-connection SOCKS5 flow
//!
//! Greeting and authentication under one deadline, request parsing, the
//! upstream dial, and the metered relay. The relay future owns both sockets,
//! so whichever way it ends (EOF, error, quota, cancellation) both close
//! together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::auth::authenticate;
use super::consts::*;
use super::request::{parse_request, send_reply};
use crate::error::GatewayError;
use crate::quota::{is_quota_exhausted, MeteredStream};
use crate::session::SessionRegistry;
use crate::store::AccountStore;

/// Drive one client connection to completion.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: Arc<AccountStore>,
    registry: Arc<SessionRegistry>,
    handshake_timeout: Duration,
    connect_timeout: Duration,
) -> Result<()> {
    // The whole greeting+auth phase shares one deadline; it is cleared once
    // the client is authenticated.
    let account = tokio::time::timeout(handshake_timeout, authenticate(&mut stream, &store))
        .await
        .map_err(|_| GatewayError::Timeout("socks greeting+auth phase".to_string()))?
        .with_context(|| format!("handshake with {peer} failed"))?;

    let target = match parse_request(&mut stream).await {
        Ok(target) => target,
        Err(err) => {
            if let Some(code) = err.reply_code() {
                let _ = send_reply(&mut stream, code).await;
            }
            return Err(err.into());
        }
    };

    debug!(username = %account.username, target = %target, "socks connect request");

    let resolved = match target.resolve().await {
        Ok(addr) => addr,
        Err(err) => {
            warn!(target = %target, error = %err, "socks target did not resolve");
            let _ = send_reply(&mut stream, SOCKS5_REPLY_GENERAL_FAILURE).await;
            return Err(GatewayError::Dial(format!("{target}: {err}")).into());
        }
    };

    let mut upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(resolved)).await
    {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(err)) => {
            warn!(target = %target, error = %err, "socks dial failed");
            let _ = send_reply(&mut stream, SOCKS5_REPLY_GENERAL_FAILURE).await;
            return Err(GatewayError::Dial(format!("{target}: {err}")).into());
        }
        Err(_) => {
            warn!(target = %target, "socks dial timed out");
            let _ = send_reply(&mut stream, SOCKS5_REPLY_GENERAL_FAILURE).await;
            return Err(GatewayError::Timeout(format!("dialing {target}")).into());
        }
    };

    send_reply(&mut stream, SOCKS5_REPLY_SUCCEEDED).await?;
    info!(username = %account.username, target = %target, "socks tunnel established");

    let (session_id, session) = registry.open(&account);
    let cancel = session.cancel_token();
    let mut client = MeteredStream::new(stream, session.counter.clone());

    let result = tokio::select! {
        result = copy_bidirectional(&mut client, &mut upstream) => Some(result),
        _ = cancel.cancelled() => None,
    };

    match &result {
        Some(Ok((up, down))) => {
            debug!(username = %account.username, up, down, "socks session finished")
        }
        Some(Err(err)) if is_quota_exhausted(err) => {
            info!(username = %account.username, "traffic quota exhausted, closing session")
        }
        Some(Err(err)) => {
            debug!(username = %account.username, error = %err, "socks relay ended")
        }
        None => debug!(username = %account.username, "socks session cancelled"),
    }

    drop(client);
    drop(upstream);
    registry.close(session_id).await;
    Ok(())
}

//! SOCKS5 gateway
//!
//! RFC 1928 with the RFC 1929 username/password method only, `CONNECT` only.
//! Credentials are checked against the shared account store and every tunnel
//! is metered against the account quota.

pub mod auth;
pub mod consts;
mod handler;
pub mod request;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SocksConfig;
use crate::session::{ConnectionGuard, ConnectionTracker, SessionRegistry};
use crate::store::AccountStore;

/// The internal SOCKS5 server.
#[derive(Debug)]
pub struct Socks5Gateway {
    store: Arc<AccountStore>,
    registry: Arc<SessionRegistry>,
    handshake_timeout: Duration,
    connect_timeout: Duration,
}

impl Socks5Gateway {
    /// Build the gateway from its configuration section.
    pub fn new(
        config: &SocksConfig,
        store: Arc<AccountStore>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            store,
            registry,
            handshake_timeout: Duration::from_secs(config.handshake_timeout),
            connect_timeout: Duration::from_secs(config.connect_timeout),
        }
    }

    /// Accept connections until shutdown.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
        tracker: ConnectionTracker,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "socks5 gateway listening");
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("socks5 gateway stopped");
                    return;
                }

                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "socks accept error");
                            continue;
                        }
                    };

                    debug!(peer = %peer, "socks connection accepted");

                    let gateway = self.clone();
                    let guard = ConnectionGuard::new(tracker.clone());
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(err) = handler::handle_connection(
                            stream,
                            peer,
                            gateway.store.clone(),
                            gateway.registry.clone(),
                            gateway.handshake_timeout,
                            gateway.connect_timeout,
                        )
                        .await
                        {
                            debug!(peer = %peer, error = %err, "socks connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

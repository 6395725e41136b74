//! SSH gateway
//!
//! A password-only SSH server whose sole purpose is client-initiated
//! `direct-tcpip` port forwarding. Each accepted TCP connection runs the
//! full SSH transport via `russh::server::run_stream`; a watcher closes the
//! connection's session (force-closing peers and flushing usage) when the
//! transport ends.

pub mod handler;
pub mod keys;

pub use handler::SshHandler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use russh::server::Config as SshServerConfig;
use russh::{MethodKind, MethodSet, SshId};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SshConfig;
use crate::session::{ConnectionGuard, ConnectionTracker, SessionRegistry};
use crate::store::AccountStore;

/// The internal SSH server.
pub struct SshGateway {
    config: Arc<SshServerConfig>,
    store: Arc<AccountStore>,
    registry: Arc<SessionRegistry>,
    connect_timeout: Duration,
}

impl SshGateway {
    /// Build the gateway; fails when a configured host key cannot be loaded.
    pub fn new(
        config: &SshConfig,
        store: Arc<AccountStore>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let server_config = build_server_config(config)?;
        Ok(Self {
            config: Arc::new(server_config),
            store,
            registry,
            connect_timeout: Duration::from_secs(config.connect_timeout),
        })
    }

    /// Accept connections until shutdown.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
        tracker: ConnectionTracker,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "ssh gateway listening");
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("ssh gateway stopped");
                    return;
                }

                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "ssh accept error");
                            continue;
                        }
                    };

                    debug!(peer = %peer, "ssh connection accepted");

                    let gateway = self.clone();
                    let guard = ConnectionGuard::new(tracker.clone());
                    tokio::spawn(async move {
                        let _guard = guard;

                        let handler = SshHandler::new(
                            gateway.store.clone(),
                            gateway.registry.clone(),
                            gateway.connect_timeout,
                        );
                        let slot = handler.session_slot();

                        match russh::server::run_stream(gateway.config.clone(), stream, handler)
                            .await
                        {
                            Ok(session) => {
                                if let Err(err) = session.await {
                                    debug!(peer = %peer, error = %err, "ssh transport closed with error");
                                }
                            }
                            Err(err) => {
                                debug!(peer = %peer, error = %err, "ssh handshake failed");
                            }
                        }

                        // Transport is gone: tear the session down.
                        if let Some(id) = slot.get() {
                            gateway.registry.close(*id).await;
                        }
                    });
                }
            }
        }
    }
}

/// Build the russh server configuration: password auth only, host key from
/// disk or a generated throwaway.
fn build_server_config(config: &SshConfig) -> Result<SshServerConfig> {
    let host_key = match &config.host_key {
        Some(path) => keys::load_host_key(path)?,
        None => {
            warn!("no host key configured, generating temporary Ed25519 key");
            keys::generate_ed25519_key()?
        }
    };
    info!(fingerprint = %keys::key_fingerprint(&host_key), "ssh host key loaded");

    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);

    Ok(SshServerConfig {
        server_id: SshId::Standard(config.server_id.clone()),
        methods,
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    })
}

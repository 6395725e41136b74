//! SSH connection handler
//!
//! Implements the russh `Handler`: password authentication against the
//! account store and client-initiated `direct-tcpip` forwarding. Everything
//! else an SSH client might ask for (sessions, shells, reverse forwards) is
//! refused.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use russh::server::{Auth, Handler, Msg, Session};
use russh::Channel;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::quota::{is_quota_exhausted, MeteredStream};
use crate::session::{Session as ActiveSession, SessionRegistry};
use crate::store::{Account, AccountStore};

/// Per-connection SSH handler.
pub struct SshHandler {
    store: Arc<AccountStore>,
    registry: Arc<SessionRegistry>,
    connect_timeout: Duration,
    account: Option<Account>,
    session: Option<Arc<ActiveSession>>,
    session_slot: Arc<OnceLock<u64>>,
}

impl SshHandler {
    /// New handler for one accepted connection.
    pub fn new(
        store: Arc<AccountStore>,
        registry: Arc<SessionRegistry>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            connect_timeout,
            account: None,
            session: None,
            session_slot: Arc::new(OnceLock::new()),
        }
    }

    /// Slot the connection watcher polls after the transport closes; set to
    /// the registry id once the first channel creates a session.
    pub fn session_slot(&self) -> Arc<OnceLock<u64>> {
        self.session_slot.clone()
    }

    /// The connection's session, created lazily on first channel open.
    fn active_session(&mut self) -> Option<Arc<ActiveSession>> {
        if let Some(session) = &self.session {
            return Some(session.clone());
        }
        let account = self.account.as_ref()?;
        let (id, session) = self.registry.open(account);
        let _ = self.session_slot.set(id);
        self.session = Some(session.clone());
        Some(session)
    }
}

impl Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.store.authenticate(user, password).await {
            Ok(account) => {
                info!(username = %user, "ssh user authenticated");
                self.account = Some(account);
                Ok(Auth::Accept)
            }
            Err(err) => {
                info!(username = %user, error = %err, "ssh authentication failed");
                Ok(Auth::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("rejecting session channel: interactive use is not supported");
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(address, port = *port, "rejecting reverse port forwarding request");
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(session) = self.active_session() else {
            warn!("rejecting direct-tcpip channel: authentication required");
            return Ok(false);
        };

        let dest = format!("{host_to_connect}:{port_to_connect}");
        debug!(
            username = %session.username,
            dest = %dest,
            orig = %format_args!("{originator_address}:{originator_port}"),
            "direct-tcpip channel open"
        );

        let dial = TcpStream::connect((host_to_connect, port_to_connect as u16));
        let mut upstream = match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => {
                let err = GatewayError::Dial(format!("{dest}: {err}"));
                warn!(error = %err, "rejecting direct-tcpip channel");
                return Ok(false);
            }
            Err(_) => {
                let err = GatewayError::Timeout(format!("dialing {dest}"));
                warn!(error = %err, "rejecting direct-tcpip channel");
                return Ok(false);
            }
        };

        let counter = session.counter.clone();
        let cancel = session.cancel_token();
        let username = session.username.clone();
        tokio::spawn(async move {
            let mut client = MeteredStream::new(channel.into_stream(), counter);
            let result = tokio::select! {
                result = copy_bidirectional(&mut client, &mut upstream) => result,
                _ = cancel.cancelled() => return,
            };
            match result {
                Ok((up, down)) => {
                    debug!(username = %username, dest = %dest, up, down, "direct-tcpip channel finished")
                }
                Err(err) if is_quota_exhausted(&err) => {
                    info!(username = %username, "traffic quota exhausted, closing channel")
                }
                Err(err) => {
                    debug!(username = %username, error = %err, "direct-tcpip relay ended")
                }
            }
        });

        Ok(true)
    }
}

//! Mixed SSH/SOCKS5 protocol multiplexer
//!
//! The public entrypoint sniffs the first client byte: `0x05` means SOCKS5,
//! anything else (including silence for the grace period; SSH clients that
//! wait for the server banner send nothing) means SSH. The connection is
//! then piped verbatim to the chosen internal backend, replaying the
//! sniffed byte first. The multiplexer is stateless and does not
//! authenticate; the backend does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::session::{ConnectionGuard, ConnectionTracker};

/// How long a silent client gets before being treated as SSH.
const SNIFF_TIMEOUT: Duration = Duration::from_millis(300);

/// Deadline for dialing the internal backend.
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First byte of every SOCKS5 exchange.
const SOCKS5_VERSION_BYTE: u8 = 0x05;

/// The public-port first-byte multiplexer.
#[derive(Debug)]
pub struct Multiplexer {
    ssh_addr: String,
    socks_addr: String,
}

impl Multiplexer {
    /// New multiplexer dialing the internal gateways on `backend_host`.
    pub fn new(backend_host: &str, ssh_port: u16, socks_port: u16) -> Self {
        Self {
            ssh_addr: format!("{backend_host}:{ssh_port}"),
            socks_addr: format!("{backend_host}:{socks_port}"),
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
            info!(address = %addr, "mixed ssh/socks entrypoint listening");
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("mixed entrypoint stopped");
                    return;
                }

                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "mixed accept error");
                            continue;
                        }
                    };

                    let mux = self.clone();
                    let guard = ConnectionGuard::new(tracker.clone());
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(err) = mux.handle_connection(stream, peer).await {
                            debug!(peer = %peer, error = %err, "mixed connection closed with error");
                        }
                    });
                }
            }
        }
    }

    /// Sniff, pick a backend, replay, pipe.
    async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut first = [0u8; 1];
        let sniffed = match tokio::time::timeout(SNIFF_TIMEOUT, client.read(&mut first)).await {
            // Client closed without sending anything.
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => Some(first[0]),
            Ok(Err(err)) => return Err(err.into()),
            // Silent client within the grace period: assume SSH.
            Err(_) => None,
        };

        let backend_addr = match sniffed {
            Some(SOCKS5_VERSION_BYTE) => self.socks_addr.as_str(),
            _ => self.ssh_addr.as_str(),
        };

        debug!(peer = %peer, backend = %backend_addr, first_byte = ?sniffed, "mixed connection routed");

        let dial = TcpStream::connect(backend_addr);
        let mut backend = match tokio::time::timeout(BACKEND_CONNECT_TIMEOUT, dial).await {
            Ok(Ok(backend)) => backend,
            Ok(Err(err)) => {
                warn!(backend = %backend_addr, error = %err, "mixed backend dial failed");
                return Err(GatewayError::Dial(format!("{backend_addr}: {err}")).into());
            }
            Err(_) => {
                warn!(backend = %backend_addr, "mixed backend dial timed out");
                return Err(GatewayError::Timeout(format!("dialing backend {backend_addr}")).into());
            }
        };

        if let Some(byte) = sniffed {
            backend.write_all(&[byte]).await?;
        }

        match copy_bidirectional(&mut client, &mut backend).await {
            Ok((up, down)) => debug!(peer = %peer, up, down, "mixed connection finished"),
            Err(err) => debug!(peer = %peer, error = %err, "mixed pipe ended"),
        }

        Ok(())
    }
}

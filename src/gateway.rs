//! Gateway assembly and lifecycle
//!
//! Wires the account store, session registry, the three TCP services, and
//! the optional DNS dispatcher together, then runs until the shutdown token
//! fires. Teardown order: listeners stop accepting, live connections get a
//! bounded drain, and one final usage flush runs unconditionally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::mux::Multiplexer;
use crate::services::dns::{DnsDispatcher, RouteTable};
use crate::services::socks::Socks5Gateway;
use crate::services::ssh::SshGateway;
use crate::session::{ConnectionTracker, SessionRegistry};
use crate::store::AccountStore;

/// Run the gateway until `shutdown` fires.
///
/// Every bind, the host key, the route table, and the database open happen
/// up front and are fatal on failure.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let store = Arc::new(
        AccountStore::connect(&config.database.url)
            .await
            .map_err(GatewayError::Database)
            .context("failed to open account database")?,
    );
    let registry = Arc::new(SessionRegistry::new(store.clone(), shutdown.clone()));
    let tracker = ConnectionTracker::new();

    let listen = &config.listen;
    let ssh_listener = TcpListener::bind((listen.backend_host.as_str(), listen.ssh_port))
        .await
        .with_context(|| format!("failed to bind ssh port {}", listen.ssh_port))?;
    let socks_listener = TcpListener::bind((listen.backend_host.as_str(), listen.socks_port))
        .await
        .with_context(|| format!("failed to bind socks port {}", listen.socks_port))?;
    let public_listener = TcpListener::bind((listen.host.as_str(), listen.public_port))
        .await
        .with_context(|| format!("failed to bind public port {}", listen.public_port))?;

    let dns = match &config.dns {
        Some(dns_config) => {
            let table = RouteTable::new(&dns_config.domains, &dns_config.backends)
                .context("invalid dns dispatch configuration")?;
            Some(
                DnsDispatcher::bind(&dns_config.listen, table)
                    .await
                    .context("failed to bind dns listener")?,
            )
        }
        None => None,
    };

    let ssh_gateway = Arc::new(SshGateway::new(&config.ssh, store.clone(), registry.clone())?);
    let socks_gateway = Arc::new(Socks5Gateway::new(
        &config.socks,
        store.clone(),
        registry.clone(),
    ));
    let mux = Arc::new(Multiplexer::new(
        &listen.backend_host,
        listen.ssh_port,
        listen.socks_port,
    ));

    let flusher = tokio::spawn(registry.clone().run_flusher());

    let mut services = Vec::new();
    services.push(tokio::spawn(ssh_gateway.run(
        ssh_listener,
        shutdown.clone(),
        tracker.clone(),
    )));
    services.push(tokio::spawn(socks_gateway.run(
        socks_listener,
        shutdown.clone(),
        tracker.clone(),
    )));
    services.push(tokio::spawn(mux.run(
        public_listener,
        shutdown.clone(),
        tracker.clone(),
    )));
    if let Some(dispatcher) = dns {
        services.push(tokio::spawn(dispatcher.run(shutdown.clone())));
    }

    info!("gateway running");
    shutdown.cancelled().await;
    info!("shutdown requested, closing listeners");

    // Accept loops return promptly once the token fires; awaiting them drops
    // the listeners.
    for service in services {
        let _ = service.await;
    }

    let active = tracker.count();
    if active > 0 {
        info!(active, "waiting for active connections to drain");
        if !tracker
            .wait_for_zero(Duration::from_secs(listen.shutdown_timeout))
            .await
        {
            warn!(
                active = tracker.count(),
                "shutdown timeout reached, abandoning remaining connections"
            );
        }
    }

    // The flusher already flushed once when the token fired; flush again so
    // bytes moved during the drain are accounted before exit.
    let _ = flusher.await;
    registry.flush_all().await;

    info!("gateway stopped");
    Ok(())
}

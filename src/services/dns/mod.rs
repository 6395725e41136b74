//! DNS zone dispatcher
//!
//! Answers UDP DNS and forwards queries whose name falls under a configured
//! zone to the matching tunnel backend, byte-for-byte in both directions.
//! Anything else is dropped without an answer; this is a dispatcher, not a
//! resolver.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// Deadline for one forwarded query/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest datagram accepted; fits EDNS0 payloads.
const MAX_DATAGRAM: usize = 4096;

/// One dispatch rule: queries under `suffix` go to `backend`.
#[derive(Debug, Clone)]
pub struct ZoneRoute {
    suffix: String,
    backend: SocketAddr,
}

impl ZoneRoute {
    /// The FQDN-terminated, lowercased zone suffix.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The backend address for this zone.
    pub fn backend(&self) -> SocketAddr {
        self.backend
    }
}

/// Ordered dispatch table; first suffix match wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<ZoneRoute>,
}

impl RouteTable {
    /// Build the table from configured zones and backends.
    ///
    /// Zones are trimmed, lowercased, and FQDN-terminated. The backend list
    /// must contain either a single address shared by every zone or exactly
    /// one address per zone, paired in input order.
    pub fn new(domains: &[String], backends: &[String]) -> Result<Self, GatewayError> {
        let domains: Vec<String> = domains
            .iter()
            .map(|domain| domain.trim().to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .map(|mut domain| {
                if !domain.ends_with('.') {
                    domain.push('.');
                }
                domain
            })
            .collect();

        if domains.is_empty() {
            return Err(GatewayError::Config(
                "at least one dns zone is required".to_string(),
            ));
        }

        let backends: Vec<&str> = backends
            .iter()
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .collect();

        if backends.is_empty() {
            return Err(GatewayError::Config(
                "at least one tunnel backend address is required".to_string(),
            ));
        }

        if backends.len() != 1 && backends.len() != domains.len() {
            return Err(GatewayError::Config(
                "tunnel backend count must be 1 or match the zone count".to_string(),
            ));
        }

        let mut routes = Vec::with_capacity(domains.len());
        for (i, suffix) in domains.into_iter().enumerate() {
            let addr = if backends.len() == 1 {
                backends[0]
            } else {
                backends[i]
            };
            let backend = addr
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| {
                    GatewayError::Config(format!("invalid tunnel backend address: {addr}"))
                })?;
            routes.push(ZoneRoute { suffix, backend });
        }

        Ok(Self { routes })
    }

    /// Backend of the first route whose suffix matches the question name.
    ///
    /// The name is lowercased and FQDN-terminated before the byte-suffix
    /// compare.
    pub fn match_backend(&self, qname: &str) -> Option<SocketAddr> {
        let mut name = qname.trim().to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        self.routes
            .iter()
            .find(|route| name.ends_with(&route.suffix))
            .map(|route| route.backend)
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table holds no routes. Construction forbids this; kept
    /// for API completeness.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// UDP server that dispatches zone-matched queries.
#[derive(Debug)]
pub struct DnsDispatcher {
    socket: Arc<UdpSocket>,
    table: Arc<RouteTable>,
}

impl DnsDispatcher {
    /// Bind the dispatcher socket; fatal at startup on failure.
    pub async fn bind(listen: &str, table: RouteTable) -> Result<Self, GatewayError> {
        let socket = UdpSocket::bind(listen).await.map_err(GatewayError::Io)?;
        let address = socket.local_addr().map_err(GatewayError::Io)?;
        info!(address = %address, zones = table.len(), "dns dispatcher listening");
        Ok(Self {
            socket: Arc::new(socket),
            table: Arc::new(table),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("dns dispatcher stopped");
                    return;
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = match result {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(error = %err, "dns receive error");
                            continue;
                        }
                    };

                    let Some(backend) = self.question_backend(&buf[..n]) else {
                        continue;
                    };

                    let query = buf[..n].to_vec();
                    let socket = self.socket.clone();
                    tokio::spawn(async move {
                        if let Err(err) = forward_query(socket, query, peer, backend).await {
                            debug!(backend = %backend, error = %err, "dns forward failed");
                        }
                    });
                }
            }
        }
    }

    /// Backend for the datagram's first question, if any route matches.
    ///
    /// Undecodable messages and messages without a question are dropped
    /// silently.
    fn question_backend(&self, datagram: &[u8]) -> Option<SocketAddr> {
        let message = Message::from_bytes(datagram).ok()?;
        let query = message.queries().first()?;
        self.table.match_backend(&query.name().to_string())
    }
}

/// Forward the original datagram verbatim and relay the reply verbatim.
/// The transaction id travels inside the untouched wire message.
async fn forward_query(
    socket: Arc<UdpSocket>,
    query: Vec<u8>,
    client: SocketAddr,
    backend: SocketAddr,
) -> io::Result<()> {
    let upstream = UdpSocket::bind("0.0.0.0:0").await?;
    upstream.connect(backend).await?;
    upstream.send(&query).await?;

    let mut reply = vec![0u8; MAX_DATAGRAM];
    let n = tokio::time::timeout(EXCHANGE_TIMEOUT, upstream.recv(&mut reply))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dns exchange timed out"))??;

    socket.send_to(&reply[..n], client).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_route_table_normalizes_zones() {
        let table = RouteTable::new(
            &strings(&["  T.Example.COM  ", "t2.example.com."]),
            &strings(&["127.0.0.1:5300"]),
        )
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.routes[0].suffix(), "t.example.com.");
        assert_eq!(table.routes[1].suffix(), "t2.example.com.");
    }

    #[test]
    fn test_route_table_rejects_empty_zones() {
        let err = RouteTable::new(&strings(&["", "  "]), &strings(&["127.0.0.1:5300"]));
        assert!(matches!(err, Err(GatewayError::Config(_))));

        let err = RouteTable::new(&[], &strings(&["127.0.0.1:5300"]));
        assert!(matches!(err, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_route_table_rejects_empty_backends() {
        let err = RouteTable::new(&strings(&["t.example.com"]), &[]);
        assert!(matches!(err, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_route_table_rejects_count_mismatch() {
        let err = RouteTable::new(
            &strings(&["a.example.com", "b.example.com", "c.example.com"]),
            &strings(&["127.0.0.1:5300", "127.0.0.1:5301"]),
        );
        assert!(matches!(err, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_route_table_rejects_bad_backend_address() {
        let err = RouteTable::new(&strings(&["t.example.com"]), &strings(&["not an addr"]));
        assert!(matches!(err, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_single_backend_broadcasts_to_all_zones() {
        let table = RouteTable::new(
            &strings(&["a.example.com", "b.example.net"]),
            &strings(&["127.0.0.1:5300"]),
        )
        .unwrap();

        let backend: SocketAddr = "127.0.0.1:5300".parse().unwrap();
        assert_eq!(table.match_backend("x.a.example.com."), Some(backend));
        assert_eq!(table.match_backend("y.b.example.net."), Some(backend));
    }

    #[test]
    fn test_paired_backends_follow_input_order() {
        let table = RouteTable::new(
            &strings(&["a.example.com", "b.example.net"]),
            &strings(&["127.0.0.1:5300", "127.0.0.1:5301"]),
        )
        .unwrap();

        assert_eq!(
            table.match_backend("x.a.example.com."),
            Some("127.0.0.1:5300".parse().unwrap())
        );
        assert_eq!(
            table.match_backend("x.b.example.net."),
            Some("127.0.0.1:5301".parse().unwrap())
        );
    }

    #[test]
    fn test_first_suffix_match_wins() {
        let table = RouteTable::new(
            &strings(&["sub.example.com", "example.com"]),
            &strings(&["127.0.0.1:5300", "127.0.0.1:5301"]),
        )
        .unwrap();

        assert_eq!(
            table.match_backend("x.sub.example.com."),
            Some("127.0.0.1:5300".parse().unwrap())
        );
        assert_eq!(
            table.match_backend("x.example.com."),
            Some("127.0.0.1:5301".parse().unwrap())
        );

        // Reversed order shadows the narrower zone.
        let table = RouteTable::new(
            &strings(&["example.com", "sub.example.com"]),
            &strings(&["127.0.0.1:5301", "127.0.0.1:5300"]),
        )
        .unwrap();
        assert_eq!(
            table.match_backend("x.sub.example.com."),
            Some("127.0.0.1:5301".parse().unwrap())
        );
    }

    #[test]
    fn test_match_is_case_insensitive_and_fqdn_tolerant() {
        let table = RouteTable::new(
            &strings(&["t.example.com"]),
            &strings(&["127.0.0.1:5300"]),
        )
        .unwrap();

        assert!(table.match_backend("X.T.Example.COM").is_some());
        assert!(table.match_backend("x.t.example.com.").is_some());
        assert!(table.match_backend("unrelated.test.").is_none());
        assert!(table.match_backend("notquite-t.example.org").is_none());
    }
}

//! SOCKS5 request parsing and replies
//!
//! Parses the CONNECT request that follows authentication and builds the
//! fixed-format replies. Only `CONNECT` is supported; the bound-address
//! field of every reply is a zeroed IPv4 address.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::consts::*;
use crate::error::Socks5Error;

/// Requested forwarding target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal socket address
    Ip(SocketAddr),
    /// Domain name plus port, resolved at connect time
    Domain(String, u16),
}

impl TargetAddr {
    /// Resolve to a socket address.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(host, port) => {
                tokio::net::lookup_host((host.as_str(), *port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "domain did not resolve")
                    })
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Parse the request following authentication.
///
/// # SOCKS5 Request Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub async fn parse_request<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]));
    }
    if header[1] != SOCKS5_CMD_TCP_CONNECT {
        return Err(Socks5Error::CommandNotSupported(header[1]));
    }

    match header[3] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Ok(TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(addr),
                port,
            ))))
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let domain_len = len_buf[0] as usize;
            if domain_len == 0 || domain_len > MAX_DOMAIN_LEN {
                return Err(Socks5Error::InvalidDomain(format!(
                    "invalid domain length: {domain_len}"
                )));
            }

            let mut domain = vec![0u8; domain_len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Socks5Error::InvalidDomain("not valid UTF-8".to_string()))?;

            let port = read_port(stream).await?;
            Ok(TargetAddr::Domain(domain, port))
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Ok(TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr),
                port,
                0,
                0,
            ))))
        }
        other => Err(Socks5Error::AddressTypeNotSupported(other)),
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<u16> {
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    Ok(u16::from_be_bytes(port_buf))
}

/// Send a reply with the given code and a zeroed bound address.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' | 0x01 | 0.0.0.0  |    0     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub async fn send_reply<S>(stream: &mut S, reply_code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS5_VERSION,
        reply_code,
        SOCKS5_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn connect_request(atyp: u8, addr: &[u8], port: u16) -> Vec<u8> {
        let mut request = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            atyp,
        ];
        request.extend_from_slice(addr);
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    #[tokio::test]
    async fn test_parse_ipv4_request() {
        let request = connect_request(SOCKS5_ADDR_TYPE_IPV4, &[127, 0, 0, 1], 80);
        let mut cursor = Cursor::new(request);

        let target = parse_request(&mut cursor).await.unwrap();
        assert_eq!(target, TargetAddr::Ip("127.0.0.1:80".parse().unwrap()));
        assert_eq!(target.to_string(), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn test_parse_domain_request() {
        let mut addr = vec![11u8];
        addr.extend_from_slice(b"example.com");
        let request = connect_request(SOCKS5_ADDR_TYPE_DOMAIN, &addr, 443);
        let mut cursor = Cursor::new(request);

        let target = parse_request(&mut cursor).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("example.com".to_string(), 443));
        assert_eq!(target.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_parse_ipv6_request() {
        let ip = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let request = connect_request(SOCKS5_ADDR_TYPE_IPV6, &ip, 8080);
        let mut cursor = Cursor::new(request);

        let target = parse_request(&mut cursor).await.unwrap();
        match target {
            TargetAddr::Ip(addr) => {
                assert!(addr.ip().is_ipv6());
                assert_eq!(addr.port(), 8080);
            }
            other => panic!("expected IPv6 address, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parse_rejects_bad_version() {
        let mut request = connect_request(SOCKS5_ADDR_TYPE_IPV4, &[127, 0, 0, 1], 80);
        request[0] = 0x04;
        let mut cursor = Cursor::new(request);

        let err = parse_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Socks5Error::UnsupportedVersion(0x04)));
        assert_eq!(err.reply_code(), None);
    }

    #[tokio::test]
    async fn test_parse_rejects_non_connect() {
        let mut request = connect_request(SOCKS5_ADDR_TYPE_IPV4, &[127, 0, 0, 1], 80);
        request[1] = SOCKS5_CMD_UDP_ASSOCIATE;
        let mut cursor = Cursor::new(request);

        let err = parse_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Socks5Error::CommandNotSupported(0x03)));
        assert_eq!(err.reply_code(), Some(SOCKS5_REPLY_COMMAND_NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn test_parse_rejects_unknown_address_type() {
        let request = connect_request(0x99, &[1, 2, 3, 4], 80);
        let mut cursor = Cursor::new(request);

        let err = parse_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Socks5Error::AddressTypeNotSupported(0x99)));
        assert_eq!(
            err.reply_code(),
            Some(SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED)
        );
    }

    #[tokio::test]
    async fn test_parse_rejects_empty_domain() {
        let request = connect_request(SOCKS5_ADDR_TYPE_DOMAIN, &[0u8], 80);
        let mut cursor = Cursor::new(request);

        let err = parse_request(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Socks5Error::InvalidDomain(_)));
        assert_eq!(
            err.reply_code(),
            Some(SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED)
        );
    }

    #[tokio::test]
    async fn test_send_reply_wire_format() {
        let mut buffer = Vec::new();
        send_reply(&mut buffer, SOCKS5_REPLY_SUCCEEDED).await.unwrap();
        assert_eq!(buffer, vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let mut buffer = Vec::new();
        send_reply(&mut buffer, SOCKS5_REPLY_GENERAL_FAILURE)
            .await
            .unwrap();
        assert_eq!(buffer[1], SOCKS5_REPLY_GENERAL_FAILURE);
        assert_eq!(buffer.len(), 10);
    }

    #[tokio::test]
    async fn test_resolve_ip_passthrough() {
        let target = TargetAddr::Ip("127.0.0.1:80".parse().unwrap());
        assert_eq!(target.resolve().await.unwrap(), "127.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost_domain() {
        let target = TargetAddr::Domain("localhost".to_string(), 80);
        let resolved = target.resolve().await.unwrap();
        assert_eq!(resolved.port(), 80);
        assert!(resolved.ip().is_loopback());
    }
}

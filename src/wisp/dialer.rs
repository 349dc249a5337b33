//! Outbound dialing for proxied streams

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::config::WispConfig;
use super::packet::StreamType;
use super::resolver::{init_resolver, resolve_host};

/// Errors from dialing a destination.
#[derive(Debug, Error)]
pub enum DialError {
    /// The stream kind is rejected by server policy, not by the network.
    #[error("stream blocked by server policy")]
    Blocked,

    #[error("name resolution failed: {0}")]
    Resolve(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("SOCKS5 proxy error: {0}")]
    Socks5(&'static str),

    #[error("SOCKS5 proxy refused connection: reply {0:#04x}")]
    Socks5Refused(u8),
}

/// An established outbound connection.
pub enum DialedSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Capability to open outbound sockets. The session engine only sees this
/// trait, so tests can substitute an implementation that records or refuses
/// calls.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        kind: StreamType,
        host: &str,
        port: u16,
    ) -> Result<DialedSocket, DialError>;
}

/// Production dialer: direct TCP/UDP, or TCP through a SOCKS5 egress proxy.
pub struct NetDialer {
    config: Arc<WispConfig>,
}

impl NetDialer {
    pub fn new(config: Arc<WispConfig>) -> Self {
        init_resolver(config.dns_server.as_deref());
        Self { config }
    }

    async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let stream = match &self.config.proxy {
            Some(proxy) => socks5_connect(proxy, host, port).await?,
            None => {
                let mut last_err = None;
                let mut stream = None;
                for addr in resolve_addrs(host, port).await? {
                    match TcpStream::connect(addr).await {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                match (stream, last_err) {
                    (Some(s), _) => s,
                    (None, Some(e)) => return Err(DialError::Io(e)),
                    (None, None) => {
                        return Err(DialError::Resolve(format!("no addresses for {}", host)));
                    }
                }
            }
        };

        if self.config.tcp_no_delay {
            let _ = stream.set_nodelay(true);
        }
        Ok(stream)
    }

    async fn dial_udp(&self, host: &str, port: u16) -> Result<UdpSocket, DialError> {
        let addr = resolve_addrs(host, port)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DialError::Resolve(format!("no addresses for {}", host)))?;

        let bind_addr = if addr.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(
        &self,
        kind: StreamType,
        host: &str,
        port: u16,
    ) -> Result<DialedSocket, DialError> {
        match kind {
            StreamType::Tcp => Ok(DialedSocket::Tcp(self.dial_tcp(host, port).await?)),
            StreamType::Udp => {
                // UDP cannot be relayed through the SOCKS5 CONNECT egress
                if self.config.disable_udp || self.config.proxy.is_some() {
                    return Err(DialError::Blocked);
                }
                Ok(DialedSocket::Udp(self.dial_udp(host, port).await?))
            }
        }
    }
}

/// Resolve `host` to socket addresses. Literal IPs skip the resolver.
async fn resolve_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>, DialError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let ips = resolve_host(host)
        .await
        .map_err(|e| DialError::Resolve(e.to_string()))?;

    Ok(ips
        .into_iter()
        .map(|ip| SocketAddr::new(ip, port))
        .collect())
}

/// SOCKS5 CONNECT through `proxy`, requesting `host:port` as a domain
/// address so the proxy performs the resolution. No-auth method only.
async fn socks5_connect(proxy: &str, host: &str, port: u16) -> Result<TcpStream, DialError> {
    let mut stream = TcpStream::connect(proxy).await?;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [0x05, 0x00] {
        debug!("SOCKS5 proxy rejected no-auth method: {:?}", method);
        return Err(DialError::Socks5("no acceptable authentication method"));
    }

    stream.write_all(&socks5_connect_request(host, port)?).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        return Err(DialError::Socks5("malformed reply"));
    }
    if reply[1] != 0x00 {
        return Err(DialError::Socks5Refused(reply[1]));
    }

    // Discard the bound address the proxy reports
    match reply[3] {
        0x01 => {
            let mut bound = [0u8; 4 + 2];
            stream.read_exact(&mut bound).await?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut bound = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut bound).await?;
        }
        0x04 => {
            let mut bound = [0u8; 16 + 2];
            stream.read_exact(&mut bound).await?;
        }
        _ => return Err(DialError::Socks5("unsupported bound address type")),
    }

    Ok(stream)
}

fn socks5_connect_request(host: &str, port: u16) -> Result<Vec<u8>, DialError> {
    if host.len() > 255 {
        return Err(DialError::Socks5("hostname longer than 255 bytes"));
    }

    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}

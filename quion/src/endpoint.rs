//! UDP endpoints.
//!
//! An endpoint is one bound UDP address feeding a socket. Construction
//! goes through socket2 for control over SO_REUSEADDR, kernel buffer
//! sizes, and v6-only, then converts into a non-blocking tokio socket
//! for the endpoint loop.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Endpoint socket options.
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    /// SO_RCVBUF, when set.
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF, when set.
    pub send_buffer_size: Option<usize>,
}

/// One bound UDP endpoint.
#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Bind a UDP endpoint with the given options.
    pub fn bind(bind_addr: SocketAddr, config: &EndpointConfig) -> Result<Self> {
        let domain = match bind_addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket =
            Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;
        socket
            .set_reuse_address(true)
            .context("setting SO_REUSEADDR")?;

        if let Some(size) = config.recv_buffer_size {
            socket
                .set_recv_buffer_size(size)
                .with_context(|| format!("setting SO_RCVBUF to {}", size))?;
        }
        if let Some(size) = config.send_buffer_size {
            socket
                .set_send_buffer_size(size)
                .with_context(|| format!("setting SO_SNDBUF to {}", size))?;
        }

        if let SocketAddr::V6(addr) = bind_addr {
            socket
                .set_only_v6(!addr.ip().is_unspecified())
                .context("setting IPV6_V6ONLY")?;
        }

        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("binding UDP socket to {}", bind_addr))?;
        socket
            .set_nonblocking(true)
            .context("setting O_NONBLOCK")?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).context("registering with tokio")?;
        let local_addr = socket.local_addr().context("reading bound address")?;
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub async fn send_to(&self, data: &[u8], remote: SocketAddr) -> std::io::Result<usize> {
        self.socket.send_to(data, remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_echo() {
        let a = Endpoint::bind("127.0.0.1:0".parse().unwrap(), &EndpointConfig::default()).unwrap();
        let b = Endpoint::bind("127.0.0.1:0".parse().unwrap(), &EndpointConfig::default()).unwrap();

        a.send_to(b"ping", b.local_addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr());
    }

    #[tokio::test]
    async fn test_bind_with_buffer_sizes() {
        let config = EndpointConfig {
            recv_buffer_size: Some(1 << 18),
            send_buffer_size: Some(1 << 18),
        };
        let ep = Endpoint::bind("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        assert_ne!(ep.local_addr().port(), 0);
    }
}

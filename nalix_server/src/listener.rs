//! TCP listener with socket-option application.

use std::net::SocketAddr;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use nalix_shared::config::ServerConfig;
use nalix_shared::error::ProtocolError;

/// Bound listen socket configured from [`ServerConfig`].
pub struct Listener {
    inner: TcpListener,
    nodelay: bool,
    keepalive: bool,
}

impl Listener {
    pub async fn bind(cfg: &ServerConfig) -> Result<Self, ProtocolError> {
        let addr: SocketAddr = cfg
            .bind_addr()
            .parse()
            .map_err(|_| ProtocolError::Config("invalid bind address"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if cfg.reuse_address {
            socket.set_reuseaddr(true)?;
        }
        socket.set_recv_buffer_size(cfg.receive_buffer_size as u32)?;
        socket.set_send_buffer_size(cfg.send_buffer_size as u32)?;
        socket.bind(addr)?;
        let inner = socket.listen(cfg.backlog)?;

        Ok(Listener {
            inner,
            nodelay: cfg.nodelay,
            keepalive: cfg.keepalive,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.inner.local_addr()?)
    }

    /// Accepts one socket and applies per-stream options.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ProtocolError> {
        let (stream, peer) = self.inner.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        if self.keepalive {
            SockRef::from(&stream).set_keepalive(true)?;
        }
        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_and_accepts() {
        let cfg = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let listener = Listener::bind(&cfg).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (stream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip(), addr.ip());
        assert!(stream.nodelay().unwrap());
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_address_is_a_config_error() {
        let cfg = ServerConfig {
            bind_ip: "not-an-ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            Listener::bind(&cfg).await,
            Err(ProtocolError::Config(_))
        ));
    }
}

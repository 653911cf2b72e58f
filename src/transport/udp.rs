//! Unicast command channel.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::error::TransportError;
use crate::transport::Transport;

/// UDP socket bound to an ephemeral port, sending to the server.
///
/// Replies come back to the same socket; use [`UdpTransport::socket`] to run
/// a receive loop on it.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Resolves the server and binds a local socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved, the socket cannot be
    /// bound, or the receive buffer cannot be sized.
    pub async fn bind(host: &str, port: u16, recv_buffer_size: usize) -> Result<Self, TransportError> {
        let peer = resolve(host, port).await?;

        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind { addr: local, source })?;

        rustix::net::sockopt::set_socket_recv_buffer_size(&socket, recv_buffer_size).map_err(
            |e| TransportError::SocketOption {
                option: "SO_RCVBUF",
                source: e.into(),
            },
        )?;

        tracing::info!(
            %peer,
            local = ?socket.local_addr().ok(),
            "command channel ready"
        );

        Ok(Self {
            socket: Arc::new(socket),
            peer,
        })
    }

    /// Returns the server address.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the underlying socket.
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

impl Transport for UdpTransport {
    fn send(
        &self,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            tracing::trace!(peer = %self.peer, "sending {} bytes", data.len());
            self.socket
                .send_to(&data, self.peer)
                .await
                .map_err(TransportError::Send)?;
            Ok(())
        })
    }
}

/// Resolves `host:port`, preferring IPv4.
async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let resolve_err = |source| TransportError::Resolve {
        host: host.to_owned(),
        source,
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(resolve_err)?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            resolve_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses found",
            ))
        })
}

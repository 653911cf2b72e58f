//! Multicast telemetry channel.
//!
//! The socket is created with `SO_REUSEADDR` so several clients on one host can
//! listen to the same group, bound to the wildcard address on the telemetry
//! port, and joined to the group on the interface that routes to the server.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use rustix::net::{AddressFamily, SocketFlags, SocketType, sockopt};
use tokio::net::UdpSocket;

use crate::error::TransportError;

/// Socket joined to the telemetry multicast group.
pub struct MulticastReceiver {
    socket: Arc<UdpSocket>,
    group: Ipv4Addr,
    interface: Ipv4Addr,
}

impl MulticastReceiver {
    /// Creates the socket and joins `group` on the interface used to reach
    /// `server`.
    ///
    /// # Errors
    ///
    /// Returns an error if `group` is not a multicast address, or if any
    /// socket, bind, option or membership step fails.
    pub async fn join(
        group: Ipv4Addr,
        port: u16,
        server: SocketAddr,
        recv_buffer_size: usize,
    ) -> Result<Self, TransportError> {
        if !group.is_multicast() {
            return Err(TransportError::NotMulticast(group));
        }

        let interface = interface_for(server).await?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

        let fd = rustix::net::socket_with(
            AddressFamily::INET,
            SocketType::DGRAM,
            SocketFlags::CLOEXEC,
            None,
        )
        .map_err(|e| {
            TransportError::Bind {
                addr: bind_addr.into(),
                source: e.into(),
            }
        })?;
        sockopt::set_socket_reuseaddr(&fd, true).map_err(|e| TransportError::SocketOption {
            option: "SO_REUSEADDR",
            source: e.into(),
        })?;
        sockopt::set_socket_recv_buffer_size(&fd, recv_buffer_size).map_err(|e| {
            TransportError::SocketOption {
                option: "SO_RCVBUF",
                source: e.into(),
            }
        })?;
        rustix::net::bind(&fd, &bind_addr).map_err(|e| TransportError::Bind {
            addr: bind_addr.into(),
            source: e.into(),
        })?;

        let std_socket = std::net::UdpSocket::from(fd);
        std_socket
            .set_nonblocking(true)
            .map_err(|source| TransportError::SocketOption {
                option: "O_NONBLOCK",
                source,
            })?;
        let socket = UdpSocket::from_std(std_socket).map_err(|source| TransportError::Bind {
            addr: bind_addr.into(),
            source,
        })?;

        socket
            .join_multicast_v4(group, interface)
            .map_err(|source| TransportError::Membership {
                group,
                interface,
                source,
            })?;

        tracing::info!(%group, port, %interface, "joined telemetry group");

        Ok(Self {
            socket: Arc::new(socket),
            group,
            interface,
        })
    }

    /// Returns the joined group.
    #[must_use]
    pub const fn group(&self) -> Ipv4Addr {
        self.group
    }

    /// Returns the local interface address the group was joined on.
    #[must_use]
    pub const fn interface(&self) -> Ipv4Addr {
        self.interface
    }

    /// Returns the underlying socket.
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

impl Drop for MulticastReceiver {
    fn drop(&mut self) {
        if let Err(e) = self.socket.leave_multicast_v4(self.group, self.interface) {
            tracing::debug!(group = %self.group, "leaving multicast group failed: {}", e);
        }
    }
}

/// Finds the local IPv4 address the kernel would route `server` through.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
async fn interface_for(server: SocketAddr) -> Result<Ipv4Addr, TransportError> {
    let SocketAddr::V4(server) = server else {
        return Ok(Ipv4Addr::UNSPECIFIED);
    };
    if server.ip().is_loopback() {
        return Ok(Ipv4Addr::LOCALHOST);
    }

    let any: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    let probe = UdpSocket::bind(any)
        .await
        .map_err(|source| TransportError::Bind { addr: any, source })?;
    probe
        .connect(server)
        .await
        .map_err(|source| TransportError::Resolve {
            host: server.ip().to_string(),
            source,
        })?;

    match probe.local_addr() {
        Ok(SocketAddr::V4(local)) => Ok(*local.ip()),
        Ok(SocketAddr::V6(_)) => Ok(Ipv4Addr::UNSPECIFIED),
        Err(source) => Err(TransportError::Bind { addr: any, source }),
    }
}

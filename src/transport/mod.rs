//! Transport layer for DexHand communication.
//!
//! Two UDP sockets carry the protocol:
//! - [`UdpTransport`]: unicast commands to the server, and its task/log replies
//! - [`MulticastReceiver`]: telemetry published to a multicast group
//!
//! Commands go out through the [`Transport`] trait so the session can run over
//! any datagram sink. Both sockets feed the same receive loop, which hands each
//! datagram to the router without ever blocking on a consumer.

pub mod multicast;
pub mod udp;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Largest datagram the receive loops accept.
pub const MAX_DATAGRAM: usize = 65_536;

/// Trait for command transports.
pub trait Transport: Send + Sync {
    /// Sends one command datagram to the server.
    fn send(
        &self,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// Receives datagrams until `closed` is cancelled or the socket fails.
///
/// A socket error ends the loop; it is logged and returned.
pub async fn receive_loop<F>(
    socket: Arc<UdpSocket>,
    channel: &'static str,
    closed: CancellationToken,
    mut on_datagram: F,
) -> Result<(), TransportError>
where
    F: FnMut(&[u8], SocketAddr) + Send,
{
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            () = closed.cancelled() => {
                tracing::debug!(channel, "receive loop stopped");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((n, from)) => {
                tracing::trace!(channel, %from, "received {} bytes", n);
                on_datagram(&buf[..n], from);
            }
            Err(e) => {
                tracing::error!(channel, "receive error: {}", e);
                return Err(TransportError::Receive(e));
            }
        }
    }
}

pub use multicast::MulticastReceiver;
pub use udp::UdpTransport;

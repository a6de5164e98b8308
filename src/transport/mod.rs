//! UDP socket construction for the export stream.
//!
//! The stream arrives either unicast on a configured port or on a multicast
//! group the bridge joins. Sockets are built with `socket2` so reuse and
//! buffer options can be set before binding, then handed to tokio.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Result, TransportError};

/// Socket construction options.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Kernel receive buffer size.
    pub recv_buffer_size: usize,
    /// Allow address reuse (several bridges on one host).
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            reuse_addr: true,
        }
    }
}

/// Bind a UDP socket for the export stream.
///
/// With a `group`, the socket joins the multicast group on the wildcard
/// interface and listens on `port`; without one it binds `0.0.0.0:port`
/// and receives only unicast.
pub fn bind_stream_socket(
    group: Option<Ipv4Addr>,
    port: u16,
    config: &SocketConfig,
) -> Result<UdpSocket> {
    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set recv buffer: {e}")))?;

    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::SocketError(format!("set reuse addr: {e}")))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        })?;

    if let Some(group) = group {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| TransportError::MulticastJoinFailed {
                group: group.to_string(),
                reason: e.to_string(),
            })?;
        debug!(%group, port, "joined multicast group");
    } else {
        debug!(port, "bound unicast stream socket");
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    UdpSocket::from_std(socket.into())
        .map_err(|e| TransportError::SocketError(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_unicast_on_ephemeral_port() {
        let socket = bind_stream_socket(None, 0, &SocketConfig::default()).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.port() > 0);
    }

    #[tokio::test]
    async fn joins_multicast_group() {
        let socket =
            bind_stream_socket(Some(crate::DEFAULT_GROUP), 0, &SocketConfig::default()).unwrap();
        assert!(socket.local_addr().is_ok());
    }
}

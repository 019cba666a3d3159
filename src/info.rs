//! Connection Information

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Information about an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// The local address for this connection.
    pub local_addr: SocketAddr,

    /// The remote address for this connection.
    pub remote_addr: SocketAddr,
}

impl ConnectionInfo {
    /// Information for a client connection to `remote`.
    ///
    /// The remote address is the one that was dialled rather than `peer_addr`,
    /// which is no longer available once the peer has reset the connection.
    pub(crate) fn client(stream: &tokio::net::TcpStream, remote: SocketAddr) -> Self {
        let local_addr = stream.local_addr().unwrap_or_else(|_| {
            let unspecified = match remote {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            SocketAddr::new(unspecified, 0)
        });

        Self {
            local_addr: make_canonical(local_addr),
            remote_addr: make_canonical(remote),
        }
    }

    /// The local address for this connection
    pub fn local_addr(&self) -> &SocketAddr {
        &self.local_addr
    }

    /// The remote address for this connection
    pub fn remote_addr(&self) -> &SocketAddr {
        &self.remote_addr
    }
}

/// Canonicalize a socket address, converting IPv4-mapped IPv6 addresses
/// (`::ffff:192.0.2.1`) into standard IPv4 addresses (`192.0.2.1`).
pub(crate) fn make_canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(_) => addr,
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(IpAddr::V4(ip), addr.port()),
            None => addr,
        },
    }
}

//! The parsed result of a PROXY header.

use bytes::Bytes;
use std::{
    fmt,
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
};

/// The header format a [ProxyInfo] was read from.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)] // A new version may be added
pub enum Version {
    /// The human-readable text line.
    V1,

    /// The binary header.
    V2,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V1 => f.write_str("v1"),
            Version::V2 => f.write_str("v2"),
        }
    }
}

/// The transport the proxied connection originally used.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum TransportProtocol {
    /// TCP, or a UNIX stream socket.
    Stream,

    /// UDP, or a UNIX datagram socket.
    Datagram,
}

/// An endpoint of the original connection, as the proxy reported it.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum NetworkAddress {
    Ipv4 {
        transport: TransportProtocol,
        address: SocketAddrV4,
    },
    Ipv6 {
        transport: TransportProtocol,
        address: SocketAddrV6,
    },
    Unix {
        transport: TransportProtocol,

        /// The socket path with its NUL padding removed.
        path: Bytes,
    },
}

impl NetworkAddress {
    /// The IP socket address, if this is not a UNIX socket.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetworkAddress::Ipv4 { address, .. } => Some(SocketAddr::V4(*address)),
            NetworkAddress::Ipv6 { address, .. } => Some(SocketAddr::V6(*address)),
            NetworkAddress::Unix { .. } => None,
        }
    }

    pub fn transport(&self) -> TransportProtocol {
        match self {
            NetworkAddress::Ipv4 { transport, .. }
            | NetworkAddress::Ipv6 { transport, .. }
            | NetworkAddress::Unix { transport, .. } => *transport,
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(address: SocketAddr) -> Self {
        match address {
            SocketAddr::V4(address) => NetworkAddress::Ipv4 {
                transport: TransportProtocol::Stream,
                address,
            },
            SocketAddr::V6(address) => NetworkAddress::Ipv6 {
                transport: TransportProtocol::Stream,
                address,
            },
        }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkAddress::Ipv4 { address, .. } => fmt::Display::fmt(address, f),
            NetworkAddress::Ipv6 { address, .. } => fmt::Display::fmt(address, f),
            NetworkAddress::Unix { path, .. } => {
                write!(f, "unix:{}", String::from_utf8_lossy(&path[..]))
            }
        }
    }
}

/// The information conveyed by a single PROXY header.
///
/// Either both addresses are present or neither is: headers with the
/// `UNKNOWN` protocol, the `LOCAL` command or an unspecified family carry no
/// addresses, and the receiver should use the real connection endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    version: Version,
    header: Bytes,
    addresses: Option<(NetworkAddress, NetworkAddress)>,
}

impl ProxyInfo {
    /// A header which carries no address information.
    pub fn unknown(version: Version, header: Bytes) -> Self {
        Self {
            version,
            header,
            addresses: None,
        }
    }

    /// A header which carries both endpoints of the original connection.
    pub fn proxied(
        version: Version,
        header: Bytes,
        source: NetworkAddress,
        destination: NetworkAddress,
    ) -> Self {
        Self {
            version,
            header,
            addresses: Some((source, destination)),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The exact bytes consumed for the header.
    pub fn header(&self) -> &Bytes {
        &self.header
    }

    /// The address the client connected from.
    pub fn source(&self) -> Option<&NetworkAddress> {
        self.addresses.as_ref().map(|(source, _)| source)
    }

    /// The address the client connected to.
    pub fn destination(&self) -> Option<&NetworkAddress> {
        self.addresses.as_ref().map(|(_, destination)| destination)
    }
}

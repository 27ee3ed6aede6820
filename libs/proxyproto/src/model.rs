//! Address family, transport protocol, command and endpoint types.
//!
//! Reference: https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Maximum length of a Unix socket path in a v2 address block.
pub const UNIX_PATH_MAX: usize = 108;

/// PROXY command (low nibble of the v2 version/command byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Connection established on purpose by the proxy (health checks).
    Local = 0x00,
    /// Connection relayed on behalf of another node.
    Proxy = 0x01,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Command::Local),
            0x01 => Ok(Command::Proxy),
            other => Err(other),
        }
    }
}

/// Address family (high nibble of the v2 family/protocol byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// Unknown, unspecified or unsupported family.
    Unspecified = 0x00,
    /// AF_INET (IPv4).
    Inet = 0x01,
    /// AF_INET6 (IPv6).
    Inet6 = 0x02,
    /// AF_UNIX.
    Unix = 0x03,
}

impl TryFrom<u8> for AddressFamily {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AddressFamily::Unspecified),
            0x01 => Ok(AddressFamily::Inet),
            0x02 => Ok(AddressFamily::Inet6),
            0x03 => Ok(AddressFamily::Unix),
            other => Err(other),
        }
    }
}

/// Transport protocol (low nibble of the v2 family/protocol byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Unknown, unspecified or unsupported protocol.
    Unspecified = 0x00,
    /// SOCK_STREAM (TCP, UNIX_STREAM).
    Stream = 0x01,
    /// SOCK_DGRAM (UDP, UNIX_DGRAM).
    Datagram = 0x02,
}

impl TryFrom<u8> for Protocol {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Protocol::Unspecified),
            0x01 => Ok(Protocol::Stream),
            0x02 => Ok(Protocol::Datagram),
            other => Err(other),
        }
    }
}

/// Pack family and protocol into the v2 wire byte.
pub fn pack_family_protocol(family: AddressFamily, protocol: Protocol) -> u8 {
    ((family as u8) << 4) | (protocol as u8)
}

/// Size of the v2 address block for a packed family/protocol byte.
pub fn address_block_len(family_protocol: u8) -> usize {
    match family_protocol {
        0x11 | 0x12 => 12,
        0x21 | 0x22 => 36,
        0x31 | 0x32 => 2 * UNIX_PATH_MAX,
        _ => 0,
    }
}

/// Unix socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnixKind {
    /// SOCK_STREAM.
    Stream,
    /// SOCK_DGRAM.
    Datagram,
}

/// Unix-domain socket address.
///
/// v2 headers NUL-pad paths to 108 bytes and decoding strips every trailing
/// NUL, so a path whose own last bytes are NUL does not survive a round trip.
/// Abstract-namespace names (leading NUL) are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnixAddr {
    /// Socket type.
    pub kind: UnixKind,
    /// Raw path bytes, without NUL padding.
    pub path: Vec<u8>,
}

impl UnixAddr {
    /// Create a new Unix address.
    pub fn new(kind: UnixKind, path: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// A network endpoint carried in (or derived from) a PROXY header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP over IPv4 or IPv6.
    Tcp(SocketAddr),
    /// UDP over IPv4 or IPv6.
    Udp(SocketAddr),
    /// Unix-domain stream or datagram socket.
    Unix(UnixAddr),
}

impl Endpoint {
    /// Address family of this endpoint.
    pub fn family(&self) -> AddressFamily {
        match self {
            Endpoint::Tcp(addr) | Endpoint::Udp(addr) => match addr {
                SocketAddr::V4(_) => AddressFamily::Inet,
                SocketAddr::V6(_) => AddressFamily::Inet6,
            },
            Endpoint::Unix(_) => AddressFamily::Unix,
        }
    }

    /// Transport protocol of this endpoint.
    pub fn protocol(&self) -> Protocol {
        match self {
            Endpoint::Tcp(_) => Protocol::Stream,
            Endpoint::Udp(_) => Protocol::Datagram,
            Endpoint::Unix(unix) => match unix.kind {
                UnixKind::Stream => Protocol::Stream,
                UnixKind::Datagram => Protocol::Datagram,
            },
        }
    }

    /// Socket address for TCP/UDP endpoints.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Tcp(addr) | Endpoint::Udp(addr) => Some(*addr),
            Endpoint::Unix(_) => None,
        }
    }

    /// IP address for TCP/UDP endpoints.
    pub fn ip(&self) -> Option<IpAddr> {
        self.socket_addr().map(|addr| addr.ip())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Udp(addr) => write!(f, "udp://{}", addr),
            Endpoint::Unix(unix) => {
                let scheme = match unix.kind {
                    UnixKind::Stream => "unix",
                    UnixKind::Datagram => "unixgram",
                };
                write!(f, "{}://{}", scheme, String::from_utf8_lossy(&unix.path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_ranges() {
        assert_eq!(Command::try_from(1), Ok(Command::Proxy));
        assert_eq!(Command::try_from(2), Err(2));
        assert_eq!(AddressFamily::try_from(3), Ok(AddressFamily::Unix));
        assert_eq!(AddressFamily::try_from(4), Err(4));
        assert_eq!(Protocol::try_from(2), Ok(Protocol::Datagram));
        assert_eq!(Protocol::try_from(3), Err(3));
    }

    #[test]
    fn test_address_block_len() {
        assert_eq!(
            address_block_len(pack_family_protocol(AddressFamily::Inet, Protocol::Stream)),
            12
        );
        assert_eq!(
            address_block_len(pack_family_protocol(AddressFamily::Inet6, Protocol::Datagram)),
            36
        );
        assert_eq!(
            address_block_len(pack_family_protocol(AddressFamily::Unix, Protocol::Stream)),
            216
        );
        assert_eq!(
            address_block_len(pack_family_protocol(
                AddressFamily::Unspecified,
                Protocol::Unspecified
            )),
            0
        );
        assert_eq!(
            address_block_len(pack_family_protocol(AddressFamily::Inet, Protocol::Unspecified)),
            0
        );
    }

    #[test]
    fn test_endpoint_family_protocol() {
        let tcp6 = Endpoint::Tcp("[2001:db8::1]:443".parse().unwrap());
        assert_eq!(tcp6.family(), AddressFamily::Inet6);
        assert_eq!(tcp6.protocol(), Protocol::Stream);

        let udp4 = Endpoint::Udp("10.0.0.1:53".parse().unwrap());
        assert_eq!(udp4.family(), AddressFamily::Inet);
        assert_eq!(udp4.protocol(), Protocol::Datagram);
        assert_eq!(udp4.ip(), Some("10.0.0.1".parse().unwrap()));

        let unix = Endpoint::Unix(UnixAddr::new(UnixKind::Datagram, "/run/log.sock"));
        assert_eq!(unix.family(), AddressFamily::Unix);
        assert_eq!(unix.protocol(), Protocol::Datagram);
        assert_eq!(unix.ip(), None);
        assert_eq!(unix.to_string(), "unixgram:///run/log.sock");
    }
}

//! Decoded PROXY headers.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use crate::codec;
use crate::conn::Connection;
use crate::error::{EncodeError, Side, TlvError};
use crate::model::{AddressFamily, Command, Endpoint, Protocol};
use crate::tlv::{self, Tlv};

/// Family token of a v1 header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum V1Family {
    /// Other, unsupported or unknown protocol.
    Unknown,
    /// TCP over IPv4.
    Tcp4,
    /// TCP over IPv6.
    Tcp6,
    /// Any other token (only produced by callers, never by decode).
    Other(String),
}

impl V1Family {
    /// The wire token.
    pub fn as_str(&self) -> &str {
        match self {
            V1Family::Unknown => "UNKNOWN",
            V1Family::Tcp4 => "TCP4",
            V1Family::Tcp6 => "TCP6",
            V1Family::Other(token) => token,
        }
    }
}

impl fmt::Display for V1Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable (version 1) header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderV1 {
    /// Family token; inferred from the source address on encode when unset.
    pub family: Option<V1Family>,
    /// Source address and port.
    pub source: Option<SocketAddr>,
    /// Destination address and port.
    pub destination: Option<SocketAddr>,
}

impl HeaderV1 {
    /// `PROXY UNKNOWN` header without address information.
    pub fn unknown() -> Self {
        Self {
            family: Some(V1Family::Unknown),
            source: None,
            destination: None,
        }
    }

    /// TCP header for the given source and destination.
    ///
    /// The family is inferred from the source address when encoding.
    pub fn from_addrs(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            family: None,
            source: Some(source),
            destination: Some(destination),
        }
    }

    /// Family token used on the wire.
    pub fn effective_family(&self) -> V1Family {
        match (&self.family, self.source) {
            (Some(family), _) => family.clone(),
            (None, Some(SocketAddr::V4(_))) => V1Family::Tcp4,
            (None, Some(SocketAddr::V6(_))) => V1Family::Tcp6,
            (None, None) => V1Family::Unknown,
        }
    }

    fn carries_addresses(&self) -> bool {
        matches!(self.effective_family(), V1Family::Tcp4 | V1Family::Tcp6)
    }
}

/// Binary (version 2) header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderV2 {
    /// LOCAL or PROXY.
    pub command: Command,
    /// Address family of the relayed connection.
    pub family: AddressFamily,
    /// Transport protocol of the relayed connection.
    pub protocol: Protocol,
    /// Source endpoint, if the family/protocol pair carries one.
    pub source: Option<Endpoint>,
    /// Destination endpoint, if the family/protocol pair carries one.
    pub destination: Option<Endpoint>,
    /// Bytes after the address block (usually a TLV stream).
    pub trailing: Bytes,
}

impl HeaderV2 {
    /// LOCAL header with no address information.
    pub fn local() -> Self {
        Self {
            command: Command::Local,
            family: AddressFamily::Unspecified,
            protocol: Protocol::Unspecified,
            source: None,
            destination: None,
            trailing: Bytes::new(),
        }
    }

    /// PROXY header for a relayed connection.
    ///
    /// Family and protocol are taken from the endpoints, which must agree.
    pub fn from_endpoints(source: Endpoint, destination: Endpoint) -> Result<Self, EncodeError> {
        let family = source.family();
        let protocol = source.protocol();
        if destination.family() != family || destination.protocol() != protocol {
            return Err(EncodeError::AddressMismatch {
                side: Side::Destination,
                expected: "same family and protocol as the source",
            });
        }

        Ok(Self {
            command: Command::Proxy,
            family,
            protocol,
            source: Some(source),
            destination: Some(destination),
            trailing: Bytes::new(),
        })
    }

    /// Replace the trailing bytes with encoded TLV records.
    pub fn with_tlvs(mut self, tlvs: &[Tlv]) -> Result<Self, EncodeError> {
        self.trailing = tlv::encode_tlvs(tlvs)?;
        Ok(self)
    }

    /// Decode the trailing bytes as TLV records.
    pub fn tlvs(&self) -> Result<Vec<Tlv>, TlvError> {
        tlv::parse_tlvs(&self.trailing)
    }
}

/// A decoded PROXY header of either version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    V1(HeaderV1),
    V2(HeaderV2),
}

impl Header {
    /// Build a header describing an incoming connection.
    ///
    /// The connection's remote endpoint becomes the source and its local
    /// endpoint the destination. Version 1 only supports TCP endpoints.
    pub fn for_connection<C: Connection>(conn: &C, version: u8) -> io::Result<Self> {
        let source = conn.remote_endpoint()?;
        let destination = conn.local_endpoint()?;

        match version {
            1 => match (source, destination) {
                (Endpoint::Tcp(src), Endpoint::Tcp(dst)) => {
                    Ok(Header::V1(HeaderV1::from_addrs(src, dst)))
                }
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "PROXY v1 only supports TCP endpoints",
                )),
            },
            2 => Ok(Header::V2(HeaderV2::from_endpoints(source, destination)?)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported PROXY version {}", other),
            )),
        }
    }

    /// Protocol version (1 or 2).
    pub fn version(&self) -> u8 {
        match self {
            Header::V1(_) => 1,
            Header::V2(_) => 2,
        }
    }

    /// Command; version 1 headers always relay a connection.
    pub fn command(&self) -> Command {
        match self {
            Header::V1(_) => Command::Proxy,
            Header::V2(h) => h.command,
        }
    }

    /// Source endpoint, if the header carries one.
    pub fn source(&self) -> Option<Endpoint> {
        match self {
            Header::V1(h) if h.carries_addresses() => h.source.map(Endpoint::Tcp),
            Header::V1(_) => None,
            Header::V2(h) => h.source.clone(),
        }
    }

    /// Destination endpoint, if the header carries one.
    pub fn destination(&self) -> Option<Endpoint> {
        match self {
            Header::V1(h) if h.carries_addresses() => h.destination.map(Endpoint::Tcp),
            Header::V1(_) => None,
            Header::V2(h) => h.destination.clone(),
        }
    }

    /// TLV records of a v2 header; always empty for v1.
    pub fn tlvs(&self) -> Result<Vec<Tlv>, TlvError> {
        match self {
            Header::V1(_) => Ok(Vec::new()),
            Header::V2(h) => h.tlvs(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the wire bytes to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Header::V1(h) => codec::v1::encode(h, dst),
            Header::V2(h) => codec::v2::encode(h, dst),
        }
    }
}

impl From<HeaderV1> for Header {
    fn from(h: HeaderV1) -> Self {
        Header::V1(h)
    }
}

impl From<HeaderV2> for Header {
    fn from(h: HeaderV2) -> Self {
        Header::V2(h)
    }
}

//! Version 2 (binary) header.
//!
//! Wire format:
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes length of everything that follows (big endian)
//! - variable: address block, then trailing bytes (TLVs)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{EncodeError, ParseError, ParseErrorKind, Side};
use crate::header::HeaderV2;
use crate::model::{
    address_block_len, pack_family_protocol, AddressFamily, Command, Endpoint, Protocol,
    UnixAddr, UnixKind, UNIX_PATH_MAX,
};

/// PROXY protocol v2 signature (12 bytes).
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Signature + version/command + family/protocol + length.
pub const V2_PREFIX_LEN: usize = 16;

/// Version 2 in the high nibble.
const VERSION_2: u8 = 0x20;

/// Decode a v2 header from the start of `buf`.
///
/// Returns `Ok(None)` until the prefix and all declared bytes are available.
pub(crate) fn decode(buf: &[u8]) -> Result<Option<(HeaderV2, usize)>, ParseError> {
    let check = buf.len().min(V2_SIGNATURE.len());
    if buf[..check] != V2_SIGNATURE[..check] {
        return Err(ParseError::new(
            ParseErrorKind::InvalidSignature,
            &buf[..buf.len().min(V2_PREFIX_LEN)],
        ));
    }
    if buf.len() < V2_PREFIX_LEN {
        return Ok(None);
    }

    let prefix = &buf[..V2_PREFIX_LEN];
    let invalid = |kind| ParseError::new(kind, prefix);

    // highest 4 bits = version
    let version = prefix[12] >> 4;
    if version != 2 {
        return Err(invalid(ParseErrorKind::InvalidVersion(version)));
    }
    // lowest 4 bits = command
    let command =
        Command::try_from(prefix[12] & 0x0F).map_err(|v| invalid(ParseErrorKind::InvalidCommand(v)))?;

    let family_protocol = prefix[13];
    let family = AddressFamily::try_from(family_protocol >> 4)
        .map_err(|v| invalid(ParseErrorKind::InvalidFamily(v)))?;
    let protocol = Protocol::try_from(family_protocol & 0x0F)
        .map_err(|v| invalid(ParseErrorKind::InvalidProtocol(v)))?;

    let declared = u16::from_be_bytes([prefix[14], prefix[15]]) as usize;
    let block_len = address_block_len(family_protocol);
    if declared < block_len {
        // The declared length cannot hold the address block it announces.
        return Err(invalid(ParseErrorKind::Truncated));
    }

    let total = V2_PREFIX_LEN + declared;
    if buf.len() < total {
        return Ok(None);
    }

    let block = &buf[V2_PREFIX_LEN..V2_PREFIX_LEN + block_len];
    let (source, destination) = match decode_addresses(family_protocol, block) {
        Some((source, destination)) => (Some(source), Some(destination)),
        None => (None, None),
    };

    let header = HeaderV2 {
        command,
        family,
        protocol,
        source,
        destination,
        trailing: Bytes::copy_from_slice(&buf[V2_PREFIX_LEN + block_len..total]),
    };
    Ok(Some((header, total)))
}

fn decode_addresses(family_protocol: u8, block: &[u8]) -> Option<(Endpoint, Endpoint)> {
    match family_protocol {
        0x11 | 0x12 => {
            let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            let dst_port = u16::from_be_bytes([block[10], block[11]]);
            Some((
                ip_endpoint(family_protocol, SocketAddr::new(IpAddr::V4(src_ip), src_port)),
                ip_endpoint(family_protocol, SocketAddr::new(IpAddr::V4(dst_ip), dst_port)),
            ))
        }
        0x21 | 0x22 => {
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&block[0..16]);
            dst_octets.copy_from_slice(&block[16..32]);
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            let dst_port = u16::from_be_bytes([block[34], block[35]]);
            Some((
                ip_endpoint(
                    family_protocol,
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                ),
                ip_endpoint(
                    family_protocol,
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
                ),
            ))
        }
        0x31 | 0x32 => {
            let kind = if family_protocol == 0x31 {
                UnixKind::Stream
            } else {
                UnixKind::Datagram
            };
            Some((
                Endpoint::Unix(UnixAddr::new(kind, trim_nul(&block[..UNIX_PATH_MAX]))),
                Endpoint::Unix(UnixAddr::new(kind, trim_nul(&block[UNIX_PATH_MAX..]))),
            ))
        }
        _ => None,
    }
}

fn ip_endpoint(family_protocol: u8, addr: SocketAddr) -> Endpoint {
    if family_protocol & 0x0F == Protocol::Datagram as u8 {
        Endpoint::Udp(addr)
    } else {
        Endpoint::Tcp(addr)
    }
}

fn trim_nul(path: &[u8]) -> Vec<u8> {
    let end = path.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    path[..end].to_vec()
}

/// Append the v2 header to `dst`.
///
/// Nothing is written if the endpoints do not match the family/protocol.
pub(crate) fn encode(header: &HeaderV2, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let family_protocol = pack_family_protocol(header.family, header.protocol);
    let block = address_block(header, family_protocol)?;

    let payload_len = block.len() + header.trailing.len();
    let len = u16::try_from(payload_len).map_err(|_| EncodeError::HeaderTooLong(payload_len))?;

    dst.reserve(V2_PREFIX_LEN + payload_len);
    dst.put_slice(&V2_SIGNATURE);
    dst.put_u8(VERSION_2 | header.command as u8);
    dst.put_u8(family_protocol);
    dst.put_u16(len);
    dst.put_slice(&block);
    dst.put_slice(&header.trailing);
    Ok(())
}

fn address_block(header: &HeaderV2, family_protocol: u8) -> Result<BytesMut, EncodeError> {
    let mut block = BytesMut::with_capacity(address_block_len(family_protocol));

    match family_protocol {
        0x11 | 0x12 | 0x21 | 0x22 => {
            let src = ip_socket_addr(header.source.as_ref(), family_protocol, Side::Source)?;
            let dst =
                ip_socket_addr(header.destination.as_ref(), family_protocol, Side::Destination)?;
            put_ip(&mut block, src.ip());
            put_ip(&mut block, dst.ip());
            block.put_u16(src.port());
            block.put_u16(dst.port());
        }
        0x31 | 0x32 => {
            let src = unix_path(header.source.as_ref(), family_protocol, Side::Source)?;
            let dst = unix_path(header.destination.as_ref(), family_protocol, Side::Destination)?;
            for path in [src, dst] {
                block.put_slice(path);
                block.put_bytes(0, UNIX_PATH_MAX - path.len());
            }
        }
        // No address block for unspecified families/protocols.
        _ => {}
    }

    Ok(block)
}

fn put_ip(block: &mut BytesMut, ip: IpAddr) {
    match ip {
        IpAddr::V4(ip) => block.put_slice(&ip.octets()),
        IpAddr::V6(ip) => block.put_slice(&ip.octets()),
    }
}

fn ip_socket_addr(
    endpoint: Option<&Endpoint>,
    family_protocol: u8,
    side: Side,
) -> Result<SocketAddr, EncodeError> {
    let mismatch = EncodeError::AddressMismatch {
        side,
        expected: describe(family_protocol),
    };

    let addr = match (endpoint, family_protocol & 0x0F) {
        (Some(Endpoint::Tcp(addr)), 0x01) | (Some(Endpoint::Udp(addr)), 0x02) => *addr,
        _ => return Err(mismatch),
    };

    match (family_protocol >> 4, addr) {
        (0x01, SocketAddr::V4(_)) | (0x02, SocketAddr::V6(_)) => Ok(addr),
        _ => Err(mismatch),
    }
}

fn unix_path(
    endpoint: Option<&Endpoint>,
    family_protocol: u8,
    side: Side,
) -> Result<&[u8], EncodeError> {
    let kind = if family_protocol == 0x31 {
        UnixKind::Stream
    } else {
        UnixKind::Datagram
    };

    match endpoint {
        Some(Endpoint::Unix(unix)) if unix.kind == kind => {
            if unix.path.len() > UNIX_PATH_MAX {
                return Err(EncodeError::UnixPathTooLong {
                    side,
                    len: unix.path.len(),
                });
            }
            Ok(&unix.path)
        }
        _ => Err(EncodeError::AddressMismatch {
            side,
            expected: describe(family_protocol),
        }),
    }
}

fn describe(family_protocol: u8) -> &'static str {
    match family_protocol {
        0x11 => "TCP over IPv4",
        0x12 => "UDP over IPv4",
        0x21 => "TCP over IPv6",
        0x22 => "UDP over IPv6",
        0x31 => "unix stream socket",
        0x32 => "unix datagram socket",
        _ => "no address",
    }
}

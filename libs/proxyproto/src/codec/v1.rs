//! Version 1 (human-readable) header.
//!
//! Format: "PROXY <INET_PROTO> <SRC_ADDR> <DST_ADDR> <SRC_PORT> <DST_PORT>\r\n"
//! Example: "PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\n"

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::error::{EncodeError, ParseError, ParseErrorKind, Side};
use crate::header::{HeaderV1, V1Family};

/// Line prefix shared by every v1 header.
const V1_PREFIX: &[u8] = b"PROXY ";

/// Maximum length of a v1 header line, CRLF included.
pub const V1_MAX_LEN: usize = 108;

/// Decode a v1 header from the start of `buf`.
///
/// Returns `Ok(None)` while the terminating newline has not arrived yet.
pub(crate) fn decode(buf: &[u8]) -> Result<Option<(HeaderV1, usize)>, ParseError> {
    let check = buf.len().min(V1_PREFIX.len());
    if buf[..check] != V1_PREFIX[..check] {
        return Err(ParseError::new(
            ParseErrorKind::InvalidSignature,
            &buf[..check],
        ));
    }

    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let Some(end) = window.iter().position(|&b| b == b'\n') else {
        if window.len() == V1_MAX_LEN {
            return Err(ParseError::new(ParseErrorKind::HeaderTooLong, window));
        }
        return Ok(None);
    };

    let line = &buf[..=end];
    match parse_line(line) {
        Ok(header) => Ok(Some((header, line.len()))),
        Err(kind) => Err(ParseError::new(kind, line)),
    }
}

/// Parse a complete line (prefix already verified, newline included).
fn parse_line(line: &[u8]) -> Result<HeaderV1, ParseErrorKind> {
    let rest = &line[V1_PREFIX.len()..];

    let (body, crlf) = match rest.strip_suffix(b"\r\n") {
        Some(body) => (body, true),
        None => (rest.strip_suffix(b"\n").unwrap_or(rest), false),
    };

    let (token, fields) = match body.iter().position(|&b| b == b' ') {
        Some(space) => (&body[..space], Some(&body[space + 1..])),
        None => (body, None),
    };
    let family = match token {
        // Anything may follow UNKNOWN, even bytes that are not text.
        b"UNKNOWN" => return Ok(HeaderV1::unknown()),
        b"TCP4" => V1Family::Tcp4,
        b"TCP6" => V1Family::Tcp6,
        other => {
            return Err(ParseErrorKind::UnsupportedFamily(
                String::from_utf8_lossy(other).into_owned(),
            ))
        }
    };

    if !crlf {
        return Err(ParseErrorKind::MalformedLine(
            "missing CRLF terminator".into(),
        ));
    }

    let fields: Vec<&str> = match fields {
        Some(fields) => std::str::from_utf8(fields)
            .map_err(|_| ParseErrorKind::MalformedLine("not valid UTF-8".into()))?
            .split(' ')
            .collect(),
        None => Vec::new(),
    };
    let [src_ip, dst_ip, src_port, dst_port] = fields.as_slice() else {
        return Err(ParseErrorKind::MalformedLine(format!(
            "expected 6 fields, got {}",
            fields.len() + 2
        )));
    };

    let src_ip = parse_ip(src_ip, Side::Source)?;
    let dst_ip = parse_ip(dst_ip, Side::Destination)?;
    let src_port = parse_port(src_port, Side::Source)?;
    let dst_port = parse_port(dst_port, Side::Destination)?;

    Ok(HeaderV1 {
        family: Some(family),
        source: Some(SocketAddr::new(src_ip, src_port)),
        destination: Some(SocketAddr::new(dst_ip, dst_port)),
    })
}

fn parse_ip(value: &str, side: Side) -> Result<IpAddr, ParseErrorKind> {
    value.parse().map_err(|_| ParseErrorKind::InvalidAddress {
        side,
        value: value.to_string(),
    })
}

fn parse_port(value: &str, side: Side) -> Result<u16, ParseErrorKind> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseErrorKind::InvalidPort {
            side,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| ParseErrorKind::InvalidPort {
        side,
        value: value.to_string(),
    })
}

/// Append the v1 line for `header` to `dst`.
pub(crate) fn encode(header: &HeaderV1, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let family = header.effective_family();

    let line = match family {
        V1Family::Tcp4 | V1Family::Tcp6 => {
            let source = header
                .source
                .ok_or(EncodeError::MissingAddress { side: Side::Source })?;
            let destination = header.destination.ok_or(EncodeError::MissingAddress {
                side: Side::Destination,
            })?;
            check_ip_version(&family, source, Side::Source)?;
            check_ip_version(&family, destination, Side::Destination)?;
            full_line(&family, source, destination)
        }
        V1Family::Other(token) if !is_valid_token(&token) => {
            return Err(EncodeError::InvalidFamilyToken(token));
        }
        _ => match (header.source, header.destination) {
            (Some(source), Some(destination)) => full_line(&family, source, destination),
            _ => format!("PROXY {}\r\n", family),
        },
    };

    if line.len() > V1_MAX_LEN {
        return Err(EncodeError::HeaderTooLong(line.len()));
    }
    dst.put_slice(line.as_bytes());
    Ok(())
}

/// A family token must be non-empty printable ASCII without spaces.
fn is_valid_token(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_graphic())
}

fn full_line(family: &V1Family, source: SocketAddr, destination: SocketAddr) -> String {
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        source.ip(),
        destination.ip(),
        source.port(),
        destination.port()
    )
}

fn check_ip_version(family: &V1Family, addr: SocketAddr, side: Side) -> Result<(), EncodeError> {
    match (family, addr) {
        (V1Family::Tcp4, SocketAddr::V4(_)) | (V1Family::Tcp6, SocketAddr::V6(_)) => Ok(()),
        (V1Family::Tcp4, _) => Err(EncodeError::AddressMismatch {
            side,
            expected: "an IPv4 address for TCP4",
        }),
        _ => Err(EncodeError::AddressMismatch {
            side,
            expected: "an IPv6 address for TCP6",
        }),
    }
}

//! Error types for PROXY header decoding and encoding.

use std::fmt;
use std::io;

use bytes::Bytes;
use thiserror::Error;

/// Which endpoint of a header a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Source (client) endpoint.
    Source,
    /// Destination (proxy listener) endpoint.
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// Cause of a failed header decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Neither the v1 nor the v2 signature matched.
    #[error("invalid signature")]
    InvalidSignature,

    /// The stream ended before the required number of bytes.
    #[error("truncated header")]
    Truncated,

    /// A v1 line exceeded 108 bytes without a terminator.
    #[error("header too long")]
    HeaderTooLong,

    /// A v1 line did not follow the expected template.
    #[error("malformed v1 header: {0}")]
    MalformedLine(String),

    /// A v1 family token other than TCP4, TCP6 or UNKNOWN.
    #[error("unsupported INET protocol/family: {0:?}")]
    UnsupportedFamily(String),

    /// A v1 address field was not a valid IP literal.
    #[error("invalid {side} address: {value:?}")]
    InvalidAddress { side: Side, value: String },

    /// A v1 port field was not a valid port number.
    #[error("invalid {side} port: {value:?}")]
    InvalidPort { side: Side, value: String },

    /// The v2 version nibble was not 2.
    #[error("invalid v2 version value: {0}")]
    InvalidVersion(u8),

    /// The v2 command nibble was out of range.
    #[error("invalid v2 command: {0:#x}")]
    InvalidCommand(u8),

    /// The v2 address family nibble was out of range.
    #[error("invalid v2 address family: {0:#x}")]
    InvalidFamily(u8),

    /// The v2 transport protocol nibble was out of range.
    #[error("invalid v2 transport protocol: {0:#x}")]
    InvalidProtocol(u8),

    /// The header deadline expired.
    #[error("timed out waiting for PROXY header")]
    TimedOut,

    /// The underlying stream failed.
    #[error("I/O error: {message}")]
    Io { kind: io::ErrorKind, message: String },
}

/// Header decode failure, carrying the raw bytes consumed so far.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct ParseError {
    kind: ParseErrorKind,
    read: Bytes,
}

impl ParseError {
    pub(crate) fn new(kind: ParseErrorKind, read: &[u8]) -> Self {
        Self {
            kind,
            read: Bytes::copy_from_slice(read),
        }
    }

    pub(crate) fn io(err: &io::Error, read: &[u8]) -> Self {
        let kind = if err.kind() == io::ErrorKind::TimedOut {
            ParseErrorKind::TimedOut
        } else {
            ParseErrorKind::Io {
                kind: err.kind(),
                message: err.to_string(),
            }
        };
        Self::new(kind, read)
    }

    /// Replace the recorded bytes with the full prefix consumed from a stream.
    pub(crate) fn with_read(self, read: &[u8]) -> Self {
        Self::new(self.kind, read)
    }

    /// The cause of the failure.
    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }

    /// All bytes read from the stream before the failure was detected.
    pub fn read(&self) -> &[u8] {
        &self.read
    }

    /// Returns true if the input ended early.
    pub fn is_truncated(&self) -> bool {
        matches!(self.kind, ParseErrorKind::Truncated)
    }

    /// Returns true if the header deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ParseErrorKind::TimedOut)
    }

    /// Returns true if the peer sent something that is not a PROXY header.
    pub fn is_signature_mismatch(&self) -> bool {
        matches!(self.kind, ParseErrorKind::InvalidSignature)
    }
}

impl From<ParseError> for io::Error {
    fn from(err: ParseError) -> Self {
        let kind = match err.kind {
            ParseErrorKind::Truncated => io::ErrorKind::UnexpectedEof,
            ParseErrorKind::TimedOut => io::ErrorKind::TimedOut,
            ParseErrorKind::Io { kind, .. } => kind,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// Header or TLV encode failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The endpoint does not fit the declared family/protocol.
    #[error("invalid {side} address: expected {expected}")]
    AddressMismatch { side: Side, expected: &'static str },

    /// A TCP4/TCP6 v1 header without an address.
    #[error("missing {side} address")]
    MissingAddress { side: Side },

    /// A caller-supplied v1 family token that would corrupt the line.
    #[error("invalid v1 family token: {0:?}")]
    InvalidFamilyToken(String),

    /// Unix socket paths are limited to 108 bytes.
    #[error("{side} unix path is {len} bytes, limit is 108")]
    UnixPathTooLong { side: Side, len: usize },

    /// Address block plus trailing bytes exceed the 16-bit length field.
    #[error("header payload of {0} bytes does not fit the length field")]
    HeaderTooLong(usize),

    /// TLV value exceeds the 16-bit length field.
    #[error("TLV value too long: {0} bytes")]
    TlvValueTooLong(usize),
}

impl From<EncodeError> for io::Error {
    fn from(err: EncodeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// TLV stream decode failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlvError {
    /// A record header or value runs past the end of the input.
    #[error("truncated TLV at offset {offset}")]
    Truncated { offset: usize },
}

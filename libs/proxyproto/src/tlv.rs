//! Type-length-value extension records trailing a v2 header.
//!
//! Each record is `type(1) length(2, big endian) value(length)`. Records are
//! only validated against their length field; interpreting the value (for
//! example checking a CRC32C) is left to the caller.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{EncodeError, TlvError};
use crate::header::Header;

/// Size of a TLV record header (type + length).
const TLV_HEADER_LEN: usize = 3;

/// TLV type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlvType(pub u8);

impl TlvType {
    /// Application-Layer Protocol Negotiation.
    pub const ALPN: TlvType = TlvType(0x01);
    /// Host name (SNI or Host header).
    pub const AUTHORITY: TlvType = TlvType(0x02);
    /// CRC32C checksum of the header (never validated here).
    pub const CRC32C: TlvType = TlvType(0x03);
    /// Padding.
    pub const NOOP: TlvType = TlvType(0x04);
    /// Opaque connection identifier.
    pub const UNIQUE_ID: TlvType = TlvType(0x05);
    /// SSL/TLS information block.
    pub const SSL: TlvType = TlvType(0x20);
    pub const SSL_VERSION: TlvType = TlvType(0x21);
    pub const SSL_CN: TlvType = TlvType(0x22);
    pub const SSL_CIPHER: TlvType = TlvType(0x23);
    pub const SSL_SIG_ALG: TlvType = TlvType(0x24);
    pub const SSL_KEY_ALG: TlvType = TlvType(0x25);
    /// Network namespace name.
    pub const NETNS: TlvType = TlvType(0x30);
}

impl fmt::Debug for TlvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            TlvType::ALPN => "ALPN",
            TlvType::AUTHORITY => "AUTHORITY",
            TlvType::CRC32C => "CRC32C",
            TlvType::NOOP => "NOOP",
            TlvType::UNIQUE_ID => "UNIQUE_ID",
            TlvType::SSL => "SSL",
            TlvType::SSL_VERSION => "SSL_VERSION",
            TlvType::SSL_CN => "SSL_CN",
            TlvType::SSL_CIPHER => "SSL_CIPHER",
            TlvType::SSL_SIG_ALG => "SSL_SIG_ALG",
            TlvType::SSL_KEY_ALG => "SSL_KEY_ALG",
            TlvType::NETNS => "NETNS",
            TlvType(other) => return write!(f, "TlvType({:#04x})", other),
        };
        f.write_str(name)
    }
}

/// A single TLV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    /// Record type.
    pub kind: TlvType,
    /// Record value.
    pub value: Bytes,
}

impl Tlv {
    /// Create a new record.
    pub fn new(kind: TlvType, value: impl Into<Bytes>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// Encoded size of this record.
    pub fn encoded_len(&self) -> usize {
        TLV_HEADER_LEN + self.value.len()
    }

    /// Append the encoded record to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let len = u16::try_from(self.value.len())
            .map_err(|_| EncodeError::TlvValueTooLong(self.value.len()))?;

        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind.0);
        dst.put_u16(len);
        dst.put_slice(&self.value);
        Ok(())
    }

    /// Encode this record into a new buffer.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Encode a sequence of records back to back.
pub fn encode_tlvs<'a, I>(tlvs: I) -> Result<Bytes, EncodeError>
where
    I: IntoIterator<Item = &'a Tlv>,
{
    let mut buf = BytesMut::new();
    for tlv in tlvs {
        tlv.encode_into(&mut buf)?;
    }
    Ok(buf.freeze())
}

/// Parse a byte slice into TLV records.
///
/// Empty input yields an empty vector.
pub fn parse_tlvs(data: &[u8]) -> Result<Vec<Tlv>, TlvError> {
    TlvIter::new(data)
        .map(|item| item.map(|(kind, value)| Tlv::new(kind, Bytes::copy_from_slice(value))))
        .collect()
}

/// Borrowing iterator over TLV records.
///
/// Yields an error once and then stops if the input is truncated.
#[derive(Debug, Clone)]
pub struct TlvIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> TlvIter<'a> {
    /// Iterate over the records in `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<(TlvType, &'a [u8]), TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let rest = &self.data[self.offset..];
        if rest.len() < TLV_HEADER_LEN {
            self.failed = true;
            return Some(Err(TlvError::Truncated {
                offset: self.offset,
            }));
        }

        let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        if rest.len() < TLV_HEADER_LEN + len {
            self.failed = true;
            return Some(Err(TlvError::Truncated {
                offset: self.offset,
            }));
        }

        let kind = TlvType(rest[0]);
        let value = &rest[TLV_HEADER_LEN..TLV_HEADER_LEN + len];
        self.offset += TLV_HEADER_LEN + len;
        Some(Ok((kind, value)))
    }
}

/// Find the first value of a TLV type in a header.
///
/// Only v2 headers carry TLVs; v1 headers and malformed TLV streams report
/// not-found once the scan reaches the bad record.
pub fn find_tlv(header: &Header, kind: TlvType) -> Option<Bytes> {
    let Header::V2(v2) = header else {
        return None;
    };

    let mut offset = 0;
    for item in TlvIter::new(&v2.trailing) {
        let (found, value) = item.ok()?;
        offset += TLV_HEADER_LEN + value.len();
        if found == kind {
            let start = offset - value.len();
            return Some(v2.trailing.slice(start..offset));
        }
    }
    None
}

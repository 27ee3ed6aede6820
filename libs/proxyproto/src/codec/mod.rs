//! PROXY header codec.
//!
//! Decoding is sans-IO and incremental: [`decode`] looks at whatever bytes
//! have arrived so far and either returns a header with the number of bytes
//! it occupies, asks for more input, or fails as soon as the input can no
//! longer be a valid header. [`read_header`] and [`write_header`] drive the
//! codec over tokio streams.

pub mod v1;
pub mod v2;

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EncodeError, ParseError, ParseErrorKind};
use crate::header::Header;

/// Bytes requested from the stream per read while waiting for a header.
const READ_CHUNK: usize = 256;

/// Decode a header of either version from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` is a valid prefix of a header that has not
/// fully arrived yet.
pub fn decode(buf: &[u8]) -> Result<Option<(Header, usize)>, ParseError> {
    match buf.first() {
        None => Ok(None),
        Some(b'P') => Ok(v1::decode(buf)?.map(|(h, n)| (Header::V1(h), n))),
        Some(0x0D) => Ok(v2::decode(buf)?.map(|(h, n)| (Header::V2(h), n))),
        Some(_) => Err(ParseError::new(ParseErrorKind::InvalidSignature, &buf[..1])),
    }
}

/// Decode a header from input that will not grow any further.
pub fn decode_eof(buf: &[u8]) -> Result<(Header, usize), ParseError> {
    decode(buf)?.ok_or_else(|| ParseError::new(ParseErrorKind::Truncated, buf))
}

/// Read a header from `reader`, buffering through `buf`.
///
/// The header bytes are removed from `buf`. Anything read past the end of
/// the header stays in `buf` and belongs to the payload. On failure `buf`
/// keeps every byte read and the error carries the same bytes.
pub async fn read_header<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Header, ParseError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let decoded = decode(buf).map_err(|err| err.with_read(buf))?;
        if let Some((header, consumed)) = decoded {
            buf.advance(consumed);
            return Ok(header);
        }

        buf.reserve(READ_CHUNK);
        match reader.read_buf(buf).await {
            Ok(0) => return Err(ParseError::new(ParseErrorKind::Truncated, buf)),
            Ok(_) => {}
            Err(e) => return Err(ParseError::io(&e, buf)),
        }
    }
}

/// Encode `header` to wire bytes.
pub fn encode(header: &Header) -> Result<Bytes, EncodeError> {
    header.encode()
}

/// Append the wire bytes of `header` to `dst`.
pub fn encode_into(header: &Header, dst: &mut BytesMut) -> Result<(), EncodeError> {
    header.encode_into(dst)
}

/// Encode `header` and write it to `writer`.
pub async fn write_header<W>(writer: &mut W, header: &Header) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = header.encode()?;
    writer.write_all(&bytes).await
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::header::{HeaderV1, HeaderV2, V1Family};
    use crate::model::{AddressFamily, Command, Endpoint, Protocol, UnixAddr, UnixKind};
    use crate::tlv::{Tlv, TlvType};

    fn v2_proxy(source: Endpoint, destination: Endpoint) -> Header {
        Header::V2(HeaderV2::from_endpoints(source, destination).unwrap())
    }

    #[rstest]
    #[case::tcp4(Endpoint::Tcp("10.0.0.1:1000".parse().unwrap()), Endpoint::Tcp("10.0.0.2:80".parse().unwrap()), 12)]
    #[case::udp4(Endpoint::Udp("10.0.0.1:5353".parse().unwrap()), Endpoint::Udp("10.0.0.2:53".parse().unwrap()), 12)]
    #[case::tcp6(Endpoint::Tcp("[2001:db8::1]:1000".parse().unwrap()), Endpoint::Tcp("[2001:db8::2]:443".parse().unwrap()), 36)]
    #[case::udp6(Endpoint::Udp("[fe80::1]:1".parse().unwrap()), Endpoint::Udp("[fe80::2]:2".parse().unwrap()), 36)]
    #[case::mapped(Endpoint::Tcp("[::ffff:10.0.0.1]:1".parse().unwrap()), Endpoint::Tcp("[::ffff:10.0.0.2]:2".parse().unwrap()), 36)]
    #[case::unix_stream(
        Endpoint::Unix(UnixAddr::new(UnixKind::Stream, "/var/run/src.sock")),
        Endpoint::Unix(UnixAddr::new(UnixKind::Stream, "/var/run/dst.sock")),
        216
    )]
    #[case::unix_dgram(
        Endpoint::Unix(UnixAddr::new(UnixKind::Datagram, "")),
        Endpoint::Unix(UnixAddr::new(UnixKind::Datagram, "/dev/log")),
        216
    )]
    fn test_v2_round_trip(
        #[case] source: Endpoint,
        #[case] destination: Endpoint,
        #[case] block_len: usize,
    ) {
        let header = v2_proxy(source, destination);
        let encoded = encode(&header).unwrap();
        assert_eq!(encoded.len(), v2::V2_PREFIX_LEN + block_len);

        let (decoded, consumed) = decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_mapped_address_stays_ipv6() {
        let header = v2_proxy(
            Endpoint::Tcp("[::ffff:192.168.0.1]:1".parse().unwrap()),
            Endpoint::Tcp("[::ffff:192.168.0.2]:2".parse().unwrap()),
        );
        let (decoded, _) = decode(&encode(&header).unwrap()).unwrap().unwrap();
        let Some(IpAddr::V6(ip)) = decoded.source().and_then(|e| e.ip()) else {
            panic!("expected IPv6 source");
        };
        assert_eq!(ip, "::ffff:192.168.0.1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_v2_tcp4_proxy_round_trip() {
        let header = v2_proxy(
            Endpoint::Tcp("192.168.0.1:1234".parse().unwrap()),
            Endpoint::Tcp("192.168.0.2:5678".parse().unwrap()),
        );
        let (decoded, _) = decode(&encode(&header).unwrap()).unwrap().unwrap();

        assert_eq!(decoded.version(), 2);
        assert_eq!(decoded.command(), Command::Proxy);
        let Header::V2(v2) = &decoded else {
            panic!("expected v2 header");
        };
        assert_eq!(v2.family, AddressFamily::Inet);
        assert_eq!(v2.protocol, Protocol::Stream);
        assert_eq!(
            decoded.source(),
            Some(Endpoint::Tcp(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
                1234
            )))
        );
        assert_eq!(
            decoded.destination(),
            Some(Endpoint::Tcp("192.168.0.2:5678".parse().unwrap()))
        );
    }

    #[test]
    fn test_v2_zero_length_address_block_is_truncated() {
        let mut data = v2::V2_SIGNATURE.to_vec();
        data.extend_from_slice(&[0x21, 0x12, 0x00, 0x00]);
        let err = decode(&data).unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_v1_unknown_minimal() {
        let (header, consumed) = decode(b"PROXY UNKNOWN\r\n").unwrap().unwrap();
        assert_eq!(consumed, 15);
        assert_eq!(header, Header::V1(HeaderV1::unknown()));
        assert_eq!(header.source(), None);
        assert_eq!(header.destination(), None);
    }

    #[test]
    fn test_v1_tcp4_exact() {
        let line = b"PROXY TCP4 192.168.0.1 192.168.0.2 1234 5678\r\n";
        let (header, consumed) = decode(line).unwrap().unwrap();
        assert_eq!(consumed, line.len());
        assert_eq!(
            header,
            Header::V1(HeaderV1 {
                family: Some(V1Family::Tcp4),
                source: Some("192.168.0.1:1234".parse().unwrap()),
                destination: Some("192.168.0.2:5678".parse().unwrap()),
            })
        );
        assert_eq!(&encode(&header).unwrap()[..], &line[..]);
    }

    #[test]
    fn test_decode_dispatch_rejects_other_bytes() {
        let err = decode(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert!(err.is_signature_mismatch());
        assert_eq!(err.read(), b"G");
        assert_eq!(decode(b"").unwrap(), None);
    }

    #[test]
    fn test_decode_eof_turns_partial_into_truncated() {
        let err = decode_eof(b"PROXY TCP4 10.0.0.1").unwrap_err();
        assert!(err.is_truncated());
        assert_eq!(err.read(), b"PROXY TCP4 10.0.0.1");

        let (header, _) = decode_eof(b"PROXY UNKNOWN\r\n").unwrap();
        assert_eq!(header.version(), 1);
    }

    #[test]
    fn test_decode_leaves_payload_alone() {
        let mut data = encode(&v2_proxy(
            Endpoint::Tcp("10.0.0.1:1".parse().unwrap()),
            Endpoint::Tcp("10.0.0.2:2".parse().unwrap()),
        ))
        .unwrap()
        .to_vec();
        let header_len = data.len();
        data.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let (_, consumed) = decode(&data).unwrap().unwrap();
        assert_eq!(consumed, header_len);
    }

    #[test]
    fn test_v2_tlvs_survive_round_trip() {
        let header = HeaderV2::from_endpoints(
            Endpoint::Tcp("10.0.0.1:1".parse().unwrap()),
            Endpoint::Tcp("10.0.0.2:2".parse().unwrap()),
        )
        .unwrap()
        .with_tlvs(&[
            Tlv::new(TlvType::ALPN, &b"h2"[..]),
            Tlv::new(TlvType::UNIQUE_ID, &b"abc"[..]),
        ])
        .unwrap();
        let header = Header::V2(header);

        let (decoded, _) = decode(&encode(&header).unwrap()).unwrap().unwrap();
        assert_eq!(decoded.tlvs().unwrap(), header.tlvs().unwrap());
        assert_eq!(decoded.tlvs().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_header_keeps_leftover() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"PROXY TCP4 10.0.0.1 ")
            .read(b"10.0.0.2 1000 80\r\nhello")
            .build();
        let mut buf = BytesMut::new();

        let header = read_header(&mut stream, &mut buf).await.unwrap();
        assert_eq!(
            header.source(),
            Some(Endpoint::Tcp("10.0.0.1:1000".parse().unwrap()))
        );
        assert_eq!(&buf[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_header_truncated_stream() {
        let mut stream = tokio_test::io::Builder::new().read(b"PROXY TCP6 ").build();
        let mut buf = BytesMut::new();

        let err = read_header(&mut stream, &mut buf).await.unwrap_err();
        assert!(err.is_truncated());
        assert_eq!(err.read(), b"PROXY TCP6 ");
    }

    #[tokio::test]
    async fn test_read_header_rejects_without_losing_bytes() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"GET / HTTP/1.1\r\n\r\n")
            .build();
        let mut buf = BytesMut::new();

        let err = read_header(&mut stream, &mut buf).await.unwrap_err();
        assert!(err.is_signature_mismatch());
        assert_eq!(err.read(), b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(&buf[..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_header_io_error() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&v2::V2_SIGNATURE[..4])
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let mut buf = BytesMut::new();

        let err = read_header(&mut stream, &mut buf).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            ParseErrorKind::Io {
                kind: io::ErrorKind::ConnectionReset,
                ..
            }
        ));
        assert_eq!(err.read(), &v2::V2_SIGNATURE[..4]);
    }

    #[tokio::test]
    async fn test_write_header() {
        let header = Header::V1(HeaderV1::from_addrs(
            "192.168.0.1:56324".parse().unwrap(),
            "192.168.0.11:443".parse().unwrap(),
        ));
        let mut stream = tokio_test::io::Builder::new()
            .write(b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\n")
            .build();

        write_header(&mut stream, &header).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_header_rejects_invalid() {
        let header = Header::V1(HeaderV1 {
            family: Some(V1Family::Tcp4),
            source: None,
            destination: None,
        });
        let mut stream = tokio_test::io::Builder::new().build();

        let err = write_header(&mut stream, &header).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    fn arb_ip_pair() -> impl Strategy<Value = (IpAddr, IpAddr)> {
        prop_oneof![
            (any::<[u8; 4]>(), any::<[u8; 4]>()).prop_map(|(a, b)| (
                IpAddr::V4(Ipv4Addr::from(a)),
                IpAddr::V4(Ipv4Addr::from(b))
            )),
            (any::<[u8; 16]>(), any::<[u8; 16]>()).prop_map(|(a, b)| (
                IpAddr::V6(Ipv6Addr::from(a)),
                IpAddr::V6(Ipv6Addr::from(b))
            )),
        ]
    }

    fn arb_endpoints() -> impl Strategy<Value = (Endpoint, Endpoint)> {
        let unix_path = || proptest::collection::vec(1u8..=255, 0..=108);
        prop_oneof![
            (arb_ip_pair(), any::<u16>(), any::<u16>(), any::<bool>()).prop_map(
                |((src, dst), sport, dport, udp)| {
                    let src = SocketAddr::new(src, sport);
                    let dst = SocketAddr::new(dst, dport);
                    if udp {
                        (Endpoint::Udp(src), Endpoint::Udp(dst))
                    } else {
                        (Endpoint::Tcp(src), Endpoint::Tcp(dst))
                    }
                }
            ),
            (unix_path(), unix_path(), any::<bool>()).prop_map(|(src, dst, dgram)| {
                let kind = if dgram {
                    UnixKind::Datagram
                } else {
                    UnixKind::Stream
                };
                (
                    Endpoint::Unix(UnixAddr::new(kind, src)),
                    Endpoint::Unix(UnixAddr::new(kind, dst)),
                )
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_v2_round_trip(
            (source, destination) in arb_endpoints(),
            trailing in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut header = HeaderV2::from_endpoints(source, destination).unwrap();
            header.trailing = Bytes::from(trailing);
            let header = Header::V2(header);

            let encoded = encode(&header).unwrap();
            let (decoded, consumed) = decode(&encoded).unwrap().unwrap();
            prop_assert_eq!(consumed, encoded.len());
            prop_assert_eq!(decoded, header);
        }

        #[test]
        fn prop_v1_round_trip(
            (src, dst) in arb_ip_pair(),
            sport in any::<u16>(),
            dport in any::<u16>(),
        ) {
            let header = Header::V1(HeaderV1::from_addrs(
                SocketAddr::new(src, sport),
                SocketAddr::new(dst, dport),
            ));
            let encoded = encode(&header).unwrap();
            let (decoded, _) = decode(&encoded).unwrap().unwrap();
            prop_assert_eq!(decoded.source(), header.source());
            prop_assert_eq!(decoded.destination(), header.destination());
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&data);
        }
    }
}

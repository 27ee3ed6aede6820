//! # proxyproto
//!
//! PROXY protocol (v1 text and v2 binary) for tokio services.
//!
//! ## Components
//!
//! - `codec`: sans-IO header decode/encode plus async read/write helpers
//! - `tlv`: type-length-value records trailing a v2 header
//! - `conn`: [`ProxiedConn`], a stream wrapper that consumes the header and
//!   reports the endpoints it carries
//! - `listener`: [`ProxyListener`], which decides per accepted connection
//!   whether a header is expected, based on source subnet rules
//! - `config`: env/serde configuration for the listener policy
//!
//! Reference: https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt

pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod header;
pub mod listener;
pub mod model;
pub mod tlv;

pub use codec::{decode, decode_eof, encode, encode_into, read_header, write_header};
pub use config::{ListenerConfig, RuleConfig};
pub use conn::{effective_deadline, Connection, ProxiedConn};
pub use error::{EncodeError, ParseError, ParseErrorKind, Side, TlvError};
pub use header::{Header, HeaderV1, HeaderV2, V1Family};
pub use listener::{
    Accepted, Acceptor, HeaderRequirement, ProxyListener, Rule, RuleTable, UnmatchedPolicy,
};
pub use model::{AddressFamily, Command, Endpoint, Protocol, UnixAddr, UnixKind};
pub use proxyproto_networking::IpPrefix;
pub use tlv::{encode_tlvs, find_tlv, parse_tlvs, Tlv, TlvIter, TlvType};

//! Listener wrapper deciding per connection whether a PROXY header is expected.
//!
//! The decision is driven by a table of rules keyed by source subnet. Rules
//! are kept most-specific-first and the first rule containing the peer's
//! address wins. The whole policy is published as one immutable snapshot,
//! so `accept` always sees a consistent view while rules change underneath.

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use proxyproto_networking::IpPrefix;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::ListenerConfig;
use crate::conn::{Connection, ProxiedConn};
use crate::model::Endpoint;

/// Header timeout for a source subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    /// Peers inside this subnet are covered by the rule.
    pub subnet: IpPrefix,
    /// Time allowed for the header; zero means no deadline.
    pub timeout: Duration,
}

impl Rule {
    /// Create a new rule.
    pub fn new(subnet: IpPrefix, timeout: Duration) -> Self {
        Self { subnet, timeout }
    }
}

/// Keep the smaller timeout; zero only survives when both are zero.
fn merge_timeout(a: Duration, b: Duration) -> Duration {
    match (a.is_zero(), b.is_zero()) {
        (true, _) => b,
        (_, true) => a,
        _ => a.min(b),
    }
}

/// Most specific first: longer prefix, then wider address, then the lower
/// concrete timeout (zero sorts after any concrete timeout).
fn cmp_specificity(a: &Rule, b: &Rule) -> Ordering {
    b.subnet
        .prefix_len()
        .cmp(&a.subnet.prefix_len())
        .then_with(|| b.subnet.bits().cmp(&a.subnet.bits()))
        .then_with(|| match (a.timeout.is_zero(), b.timeout.is_zero()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a.timeout.cmp(&b.timeout),
        })
}

/// Sorted, deduplicated rule list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Build a table, merging rules with identical subnets.
    pub fn from_rules<I: IntoIterator<Item = Rule>>(rules: I) -> Self {
        Self::default().with_rules(rules)
    }

    /// A new table with `rules` merged into this one.
    pub fn with_rules<I: IntoIterator<Item = Rule>>(&self, rules: I) -> Self {
        let mut merged = self.rules.clone();
        for rule in rules {
            match merged.iter_mut().find(|r| r.subnet == rule.subnet) {
                Some(existing) => existing.timeout = merge_timeout(existing.timeout, rule.timeout),
                None => merged.push(rule),
            }
        }
        merged.sort_by(cmp_specificity);
        Self { rules: merged }
    }

    /// First rule whose subnet contains `ip`.
    pub fn lookup(&self, ip: IpAddr) -> Option<&Rule> {
        self.rules.iter().find(|r| r.subnet.contains(ip))
    }

    /// Rules in match order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// What to do with a peer no rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmatchedPolicy {
    /// Require a header under the default timeout.
    #[default]
    #[serde(rename = "require")]
    RequireHeader,
    /// Hand the raw connection through; no header expected.
    #[serde(rename = "skip")]
    Skip,
}

impl FromStr for UnmatchedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "require" => Ok(UnmatchedPolicy::RequireHeader),
            "skip" => Ok(UnmatchedPolicy::Skip),
            other => Err(format!("unknown unmatched policy {:?}", other)),
        }
    }
}

impl fmt::Display for UnmatchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmatchedPolicy::RequireHeader => f.write_str("require"),
            UnmatchedPolicy::Skip => f.write_str("skip"),
        }
    }
}

/// Outcome of a policy lookup for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRequirement {
    /// A header must arrive within the timeout (zero means no deadline).
    Required { timeout: Duration },
    /// The connection carries no header.
    NotExpected,
}

/// Immutable policy published to `accept`.
#[derive(Debug, Clone, Default)]
struct PolicySnapshot {
    rules: RuleTable,
    default_timeout: Duration,
    unmatched: UnmatchedPolicy,
}

impl PolicySnapshot {
    fn requirement_for(&self, ip: IpAddr) -> HeaderRequirement {
        if let Some(rule) = self.rules.lookup(ip) {
            return HeaderRequirement::Required {
                timeout: rule.timeout,
            };
        }
        match self.unmatched {
            UnmatchedPolicy::RequireHeader => HeaderRequirement::Required {
                timeout: self.default_timeout,
            },
            UnmatchedPolicy::Skip => HeaderRequirement::NotExpected,
        }
    }
}

/// Source of raw connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    type Conn: Connection;

    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<Self::Conn>;

    /// Endpoint the acceptor is bound to.
    fn local_endpoint(&self) -> io::Result<Endpoint>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).await.map(|(stream, _)| stream)
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr().map(Endpoint::Tcp)
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for tokio::net::UnixListener {
    type Conn = tokio::net::UnixStream;

    async fn accept(&self) -> io::Result<tokio::net::UnixStream> {
        tokio::net::UnixListener::accept(self)
            .await
            .map(|(stream, _)| stream)
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr()
            .map(|addr| crate::conn::unix_endpoint(&addr))
    }
}

/// Listener that wraps accepted connections according to the subnet policy.
///
/// Uses ArcSwap for lock-free policy reads; writers publish whole snapshots
/// with `rcu`, so concurrent updates are never lost.
pub struct ProxyListener<A> {
    acceptor: A,
    policy: ArcSwap<PolicySnapshot>,
}

impl<A: Acceptor> ProxyListener<A> {
    /// Wrap `acceptor`. With no rules, every peer must send a header within
    /// `default_timeout`.
    pub fn new(acceptor: A, default_timeout: Duration) -> Self {
        Self {
            acceptor,
            policy: ArcSwap::from_pointee(PolicySnapshot {
                default_timeout,
                ..PolicySnapshot::default()
            }),
        }
    }

    /// Wrap `acceptor` with a loaded configuration.
    pub fn with_config(acceptor: A, config: &ListenerConfig) -> Self {
        let listener = Self::new(acceptor, config.default_timeout());
        listener.set_unmatched_policy(config.unmatched);
        listener.set_rules(config.rules());
        listener
    }

    /// Accept the next connection and apply the policy to it.
    pub async fn accept(&self) -> io::Result<Accepted<A::Conn>> {
        let conn = self.acceptor.accept().await?;
        let remote = conn.remote_endpoint()?;

        let Some(ip) = remote.ip() else {
            debug!(remote = %remote, "Non-IP peer, no PROXY header expected");
            return Ok(Accepted::Direct(conn));
        };

        match self.requirement_for(ip) {
            HeaderRequirement::Required { timeout } => {
                debug!(
                    remote = %remote,
                    timeout_ms = timeout.as_millis() as u64,
                    "PROXY header required"
                );
                Ok(Accepted::Proxied(ProxiedConn::with_header_timeout(
                    conn, timeout,
                )))
            }
            HeaderRequirement::NotExpected => {
                debug!(remote = %remote, "No rule matched, passing connection through");
                Ok(Accepted::Direct(conn))
            }
        }
    }

    /// Endpoint of the underlying acceptor.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.acceptor.local_endpoint()
    }

    /// The underlying acceptor.
    pub fn get_ref(&self) -> &A {
        &self.acceptor
    }
}

impl<A> ProxyListener<A> {
    /// Merge `rules` into the table.
    ///
    /// A rule for a subnet already present keeps the smaller non-zero timeout.
    pub fn add_rules<I: IntoIterator<Item = Rule>>(&self, rules: I) {
        let rules: Vec<Rule> = rules.into_iter().collect();
        self.policy.rcu(|current| PolicySnapshot {
            rules: current.rules.with_rules(rules.iter().copied()),
            ..PolicySnapshot::clone(current)
        });
        info!(
            added = rules.len(),
            rule_count = self.policy.load().rules.len(),
            "PROXY rule table extended"
        );
    }

    /// Replace the table, merging duplicate subnets.
    pub fn set_rules<I: IntoIterator<Item = Rule>>(&self, rules: I) {
        let table = RuleTable::from_rules(rules);
        let rule_count = table.len();
        self.policy.rcu(|current| PolicySnapshot {
            rules: table.clone(),
            ..PolicySnapshot::clone(current)
        });
        info!(rule_count = rule_count, "PROXY rule table replaced");
    }

    /// Rules in match order.
    pub fn rules(&self) -> Vec<Rule> {
        self.policy.load().rules.rules().to_vec()
    }

    /// Timeout applied to unmatched peers under `UnmatchedPolicy::RequireHeader`.
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.policy.rcu(|current| PolicySnapshot {
            default_timeout: timeout,
            ..PolicySnapshot::clone(current)
        });
    }

    pub fn set_unmatched_policy(&self, unmatched: UnmatchedPolicy) {
        self.policy.rcu(|current| PolicySnapshot {
            unmatched,
            ..PolicySnapshot::clone(current)
        });
    }

    /// Header requirement for a peer address under the current policy.
    pub fn requirement_for(&self, ip: IpAddr) -> HeaderRequirement {
        self.policy.load().requirement_for(ip)
    }
}

/// A connection returned by [`ProxyListener::accept`].
pub enum Accepted<C> {
    /// No header expected; the raw connection.
    Direct(C),
    /// A header is expected before the payload.
    Proxied(ProxiedConn<C>),
}

impl<C: Connection> Accepted<C> {
    pub fn is_proxied(&self) -> bool {
        matches!(self, Accepted::Proxied(_))
    }

    /// Local endpoint, taken from the header when one was received.
    pub async fn local_endpoint(&mut self) -> io::Result<Endpoint> {
        match self {
            Accepted::Direct(conn) => conn.local_endpoint(),
            Accepted::Proxied(conn) => conn.local_endpoint().await,
        }
    }

    /// Remote endpoint, taken from the header when one was received.
    pub async fn remote_endpoint(&mut self) -> io::Result<Endpoint> {
        match self {
            Accepted::Direct(conn) => conn.remote_endpoint(),
            Accepted::Proxied(conn) => conn.remote_endpoint().await,
        }
    }
}

impl<C: Connection> AsyncRead for Accepted<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Accepted::Direct(conn) => Pin::new(conn).poll_read(cx, buf),
            Accepted::Proxied(conn) => Pin::new(conn).poll_read(cx, buf),
        }
    }
}

impl<C: Connection> AsyncWrite for Accepted<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Accepted::Direct(conn) => Pin::new(conn).poll_write(cx, buf),
            Accepted::Proxied(conn) => Pin::new(conn).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Accepted::Direct(conn) => Pin::new(conn).poll_flush(cx),
            Accepted::Proxied(conn) => Pin::new(conn).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Accepted::Direct(conn) => Pin::new(conn).poll_shutdown(cx),
            Accepted::Proxied(conn) => Pin::new(conn).poll_shutdown(cx),
        }
    }
}

impl<C> fmt::Debug for Accepted<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accepted::Direct(_) => f.write_str("Accepted::Direct"),
            Accepted::Proxied(_) => f.write_str("Accepted::Proxied"),
        }
    }
}

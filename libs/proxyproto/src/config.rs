//! Listener policy configuration.
//!
//! Loadable from the environment or embedded in a larger serde document.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use proxyproto_networking::IpPrefix;
use serde::{Deserialize, Serialize};

use crate::listener::{Rule, UnmatchedPolicy};

/// Default time allowed for a header when no rule applies.
pub const DEFAULT_HEADER_TIMEOUT_MS: u64 = 5000;

/// One subnet rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Source subnet in CIDR notation.
    pub subnet: IpPrefix,
    /// Header timeout in milliseconds; 0 disables the deadline.
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Header timeout for peers no rule matches.
    pub default_timeout_ms: u64,

    /// Whether unmatched peers must send a header.
    pub unmatched: UnmatchedPolicy,

    /// Per-subnet rules.
    pub rules: Vec<RuleConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_HEADER_TIMEOUT_MS,
            unmatched: UnmatchedPolicy::default(),
            rules: Vec::new(),
        }
    }
}

impl ListenerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_timeout_ms: u64 = lookup("PROXYPROTO_HEADER_TIMEOUT_MS")
            .map(|v| v.trim().parse())
            .transpose()
            .context("PROXYPROTO_HEADER_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_HEADER_TIMEOUT_MS);

        let unmatched = lookup("PROXYPROTO_UNMATCHED")
            .map(|v| v.parse::<UnmatchedPolicy>())
            .transpose()
            .map_err(anyhow::Error::msg)
            .context("PROXYPROTO_UNMATCHED must be 'require' or 'skip'.")?
            .unwrap_or_default();

        let rules = match lookup("PROXYPROTO_RULES") {
            Some(raw) => parse_rules(&raw).context("Invalid PROXYPROTO_RULES.")?,
            None => Vec::new(),
        };

        Ok(Self {
            default_timeout_ms,
            unmatched,
            rules,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Rules ready to install on a listener.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules
            .iter()
            .map(|r| Rule::new(r.subnet, Duration::from_millis(r.timeout_ms)))
            .collect()
    }
}

/// Parse `cidr[=ms],...`. A bare address is a single-host subnet.
fn parse_rules(raw: &str) -> Result<Vec<RuleConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (subnet, timeout) = match entry.split_once('=') {
                Some((subnet, timeout)) => (subnet.trim(), Some(timeout.trim())),
                None => (entry, None),
            };

            let subnet = if subnet.contains('/') {
                IpPrefix::from_cidr(subnet)
                    .with_context(|| format!("bad subnet in rule {:?}", entry))?
            } else {
                let ip: IpAddr = subnet
                    .parse()
                    .with_context(|| format!("bad address in rule {:?}", entry))?;
                IpPrefix::host(ip)
            };

            let timeout_ms = timeout
                .map(str::parse)
                .transpose()
                .with_context(|| format!("bad timeout in rule {:?}", entry))?
                .unwrap_or(0);

            Ok(RuleConfig { subnet, timeout_ms })
        })
        .collect()
}

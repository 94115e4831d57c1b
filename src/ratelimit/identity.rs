//! Client identity derivation.
//!
//! Anonymous clients are identified by network address. Addresses are
//! canonicalized before they become keys so that one client cannot appear
//! under two spellings, for example `192.0.2.1` and `::ffff:192.0.2.1`.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Key shared by every request whose address cannot be determined.
pub const UNKNOWN_KEY: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The single forwarded-address source the operator trusts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ForwardedSource {
    /// Not behind a proxy; use the peer address only
    #[default]
    None,
    /// Take the address `hops` entries from the right of `X-Forwarded-For`
    XForwardedFor { hops: usize },
    /// A single-valued header written by the proxy, e.g. `X-Real-IP`
    Header { name: String },
}

/// Address metadata for one request, as supplied by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySource {
    /// Peer address of the connection (`ip` or `ip:port`)
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Raw value of the trusted forwarded-address header
    #[serde(default)]
    pub forwarded: Option<String>,
}

impl IdentitySource {
    pub fn from_remote(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(remote_addr.into()),
            forwarded: None,
        }
    }

    pub fn with_forwarded(mut self, forwarded: impl Into<String>) -> Self {
        self.forwarded = Some(forwarded.into());
        self
    }
}

/// A derived client key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn unknown() -> Self {
        ClientKey(UNKNOWN_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_KEY
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives [`ClientKey`]s from request address metadata.
#[derive(Debug, Clone, Default)]
pub struct IdentityExtractor {
    forwarded: ForwardedSource,
    ipv6_prefix: Option<u8>,
}

impl IdentityExtractor {
    pub fn new(forwarded: ForwardedSource) -> Self {
        Self {
            forwarded,
            ipv6_prefix: None,
        }
    }

    /// Group IPv6 clients by network prefix instead of full address.
    pub fn with_ipv6_prefix(mut self, prefix: Option<u8>) -> Self {
        self.ipv6_prefix = prefix;
        self
    }

    /// Name of the header the router should pass as `forwarded`, if any.
    pub fn forwarded_header(&self) -> Option<&str> {
        match &self.forwarded {
            ForwardedSource::None => None,
            ForwardedSource::XForwardedFor { .. } => Some(X_FORWARDED_FOR),
            ForwardedSource::Header { name } => Some(name.as_str()),
        }
    }

    /// Derive the key for a request.
    ///
    /// Prefers the trusted forwarded address, then the peer address, and
    /// falls back to [`UNKNOWN_KEY`] so unidentifiable requests are still
    /// throttled together.
    pub fn extract(&self, source: &IdentitySource) -> ClientKey {
        let ip = source
            .forwarded
            .as_deref()
            .and_then(|value| self.forwarded_ip(value))
            .or_else(|| source.remote_addr.as_deref().and_then(parse_addr));

        match ip {
            Some(ip) => self.key_for(ip),
            None => {
                debug!(source = ?source, "Could not resolve client address");
                ClientKey::unknown()
            }
        }
    }

    /// Build the key for an already-parsed address.
    pub fn key_for(&self, ip: IpAddr) -> ClientKey {
        match ip.to_canonical() {
            IpAddr::V4(v4) => ClientKey(v4.to_string()),
            IpAddr::V6(v6) => match self.ipv6_prefix {
                Some(prefix) if prefix < 128 => {
                    ClientKey(format!("{}/{}", mask_v6(v6, prefix), prefix))
                }
                _ => ClientKey(v6.to_string()),
            },
        }
    }

    fn forwarded_ip(&self, value: &str) -> Option<IpAddr> {
        match &self.forwarded {
            ForwardedSource::None => None,
            ForwardedSource::Header { .. } => parse_addr(value),
            ForwardedSource::XForwardedFor { hops } => {
                let entries: Vec<&str> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .collect();
                if entries.is_empty() || *hops == 0 {
                    return None;
                }
                let index = entries.len().saturating_sub(*hops);
                parse_addr(entries[index])
            }
        }
    }
}

/// Parse `ip`, `ip:port`, `[ipv6]`, `[ipv6]:port` or `ipv6%zone`.
fn parse_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr.ip());
    }

    let unbracketed = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(raw);
    let without_zone = unbracketed
        .split_once('%')
        .map(|(addr, _)| addr)
        .unwrap_or(unbracketed);

    without_zone.parse::<IpAddr>().ok()
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let bits = u128::from(addr);
    let mask = match prefix {
        0 => 0,
        p if p >= 128 => u128::MAX,
        p => u128::MAX << (128 - u32::from(p)),
    };
    Ipv6Addr::from(bits & mask)
}

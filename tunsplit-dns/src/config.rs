//! Upstream resolver configuration
//!
//! Hostname exceptions are resolved either through the system resolver or
//! through explicit upstreams written as:
//! - `IP` or `IP:port` or `IP[:port]/udp` - plain DNS over UDP
//! - `IP[:port]/tcp` - plain DNS over TCP
//!
//! Encrypted transports are rejected: exception lookups happen while the
//! tunnel is being reconfigured and must not depend on the tunnel itself.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Strategy for selecting upstream DNS servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamStrategy {
    /// Ask every upstream in parallel, keep the first good answer (default)
    #[default]
    FirstReply,

    /// Rotate through upstreams in order
    RoundRobin,

    /// Pick a random upstream per lookup
    Random,
}

impl std::fmt::Display for UpstreamStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamStrategy::FirstReply => write!(f, "first-reply"),
            UpstreamStrategy::RoundRobin => write!(f, "round-robin"),
            UpstreamStrategy::Random => write!(f, "random"),
        }
    }
}

impl FromStr for UpstreamStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "first-reply" | "first_reply" => Ok(UpstreamStrategy::FirstReply),
            "round-robin" | "round_robin" => Ok(UpstreamStrategy::RoundRobin),
            "random" => Ok(UpstreamStrategy::Random),
            _ => Err(Error::Config(format!(
                "unknown upstream strategy '{}', expected 'first-reply', 'round-robin', or 'random'",
                s
            ))),
        }
    }
}

/// An upstream DNS server used for exception lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsServerSpec {
    /// Plain DNS over UDP
    Udp { addr: SocketAddr },

    /// Plain DNS over TCP
    Tcp { addr: SocketAddr },
}

impl DnsServerSpec {
    pub fn addr(&self) -> SocketAddr {
        match self {
            DnsServerSpec::Udp { addr } | DnsServerSpec::Tcp { addr } => *addr,
        }
    }
}

impl std::fmt::Display for DnsServerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsServerSpec::Udp { addr } => write!(f, "{}/udp", addr),
            DnsServerSpec::Tcp { addr } => write!(f, "{}/tcp", addr),
        }
    }
}

impl FromStr for DnsServerSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_dns_server(s)
    }
}

/// Parse a DNS server specification string
///
/// Supported formats:
/// - `8.8.8.8` - UDP to 8.8.8.8:53
/// - `8.8.8.8:5353` - UDP to 8.8.8.8:5353
/// - `8.8.8.8/udp` - UDP to 8.8.8.8:53
/// - `8.8.8.8/tcp` - TCP to 8.8.8.8:53
/// - `[2001:4860:4860::8888]:53/tcp` - TCP over IPv6
pub fn parse_dns_server(s: &str) -> Result<DnsServerSpec> {
    let s = s.trim();

    if s.starts_with("https://") || s.starts_with("tls://") {
        return Err(Error::Config(format!(
            "encrypted upstream '{}' is not supported for exception lookups",
            s
        )));
    }

    let (addr_part, tcp) = match s.rfind('/') {
        Some(idx) => {
            let proto = &s[idx + 1..];
            match proto.to_lowercase().as_str() {
                "udp" => (&s[..idx], false),
                "tcp" => (&s[..idx], true),
                _ => {
                    return Err(Error::Config(format!(
                        "unknown DNS protocol '{}', expected 'udp' or 'tcp'",
                        proto
                    )))
                }
            }
        }
        None => (s, false),
    };

    let addr = parse_socket_addr(addr_part, 53)?;

    if tcp {
        Ok(DnsServerSpec::Tcp { addr })
    } else {
        Ok(DnsServerSpec::Udp { addr })
    }
}

/// Parse an IP address with optional port, defaulting to the given port
fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }

    // Bracketed IPv6 without a port: [::1]
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let ip = inner
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", inner, e)))?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    Err(Error::Config(format!(
        "cannot parse DNS server address '{}'",
        s
    )))
}

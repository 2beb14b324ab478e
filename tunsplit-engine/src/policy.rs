//! Policy and connection state fed into the controller

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which traffic the split tunnel rules describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitTunnelMode {
    /// Listed apps and destinations bypass the tunnel
    #[default]
    Exclude,
    /// Only listed apps and destinations use the tunnel
    Include,
}

impl std::fmt::Display for SplitTunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitTunnelMode::Exclude => write!(f, "exclude"),
            SplitTunnelMode::Include => write!(f, "include"),
        }
    }
}

impl FromStr for SplitTunnelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "exclude" => Ok(SplitTunnelMode::Exclude),
            "include" => Ok(SplitTunnelMode::Include),
            _ => Err(Error::InvalidPolicy(format!(
                "unknown split tunnel mode '{}', expected 'exclude' or 'include'",
                s
            ))),
        }
    }
}

/// Active tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(rename = "openvpn")]
    OpenVpn,
    Ikev2,
    #[serde(rename = "wireguard")]
    WireGuard,
    /// Stunnel and WStunnel
    #[serde(alias = "wstunnel")]
    Stunnel,
    #[default]
    None,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::OpenVpn => "OpenVPN",
            Protocol::Ikev2 => "IKEv2",
            Protocol::WireGuard => "WireGuard",
            Protocol::Stunnel => "Stunnel",
            Protocol::None => "none",
        };
        f.write_str(name)
    }
}

/// Split tunnel settings as chosen by the user
///
/// Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySettings {
    pub active: bool,
    pub mode: SplitTunnelMode,
    /// Executable paths, in the order given, without duplicates
    pub apps: Vec<PathBuf>,
    /// Literal addresses and networks
    pub ips: BTreeSet<IpNet>,
    /// Normalized hostnames
    pub hostnames: BTreeSet<String>,
}

impl PolicySettings {
    pub fn new<A, I, H>(active: bool, mode: SplitTunnelMode, apps: A, ips: I, hostnames: H) -> Self
    where
        A: IntoIterator,
        A::Item: Into<PathBuf>,
        I: IntoIterator<Item = IpNet>,
        H: IntoIterator,
        H::Item: AsRef<str>,
    {
        let mut ordered_apps: Vec<PathBuf> = Vec::new();
        for app in apps {
            let app = app.into();
            if !ordered_apps.contains(&app) {
                ordered_apps.push(app);
            }
        }

        Self {
            active,
            mode,
            apps: ordered_apps,
            ips: ips.into_iter().collect(),
            hostnames: hostnames
                .into_iter()
                .filter_map(|h| normalize_hostname(h.as_ref()))
                .collect(),
        }
    }

    /// Parse textual IP/CIDR entries, as found in config files
    pub fn parse_ips<I, S>(entries: I) -> Result<BTreeSet<IpNet>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        entries
            .into_iter()
            .filter(|e| !e.as_ref().trim().is_empty())
            .map(|e| parse_ip_entry(e.as_ref()))
            .collect()
    }
}

/// Parse `1.2.3.4`, `10.0.0.0/8`, or `2001:db8::/32`
pub fn parse_ip_entry(entry: &str) -> Result<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::InvalidPolicy(format!("'{}' is not an IP address or CIDR", entry)))
}

/// Lowercase, trim, and strip the trailing dot; empty names become `None`
pub fn normalize_hostname(name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Addresses of one network adapter; either may be unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterInfo {
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
}

impl AdapterInfo {
    pub fn new(ip: Option<IpAddr>, gateway_ip: Option<IpAddr>) -> Self {
        Self { ip, gateway_ip }
    }
}

/// Tunnel connection state, replaced atomically on every change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub vpn_adapter: AdapterInfo,
    #[serde(default)]
    pub default_adapter: AdapterInfo,
}

impl ConnectionStatus {
    pub fn connected(protocol: Protocol, vpn_adapter: AdapterInfo, default_adapter: AdapterInfo) -> Self {
        Self {
            is_connected: true,
            protocol,
            vpn_adapter,
            default_adapter,
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }
}

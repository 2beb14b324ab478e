//! Configuration types for the split tunnel engine

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::{AdapterInfo, ConnectionStatus, PolicySettings, Protocol, SplitTunnelMode};
use tunsplit_dns::{
    parse_dns_server, DnsServerSpec, HostLookup, HostnameResolver, SystemLookup, UpstreamLookup,
    UpstreamStrategy,
};
use tunsplit_enforce::BackendConfig;

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [common]
/// log_level = "info"
///
/// [split_tunnel]
/// active = true
/// mode = "exclude"
/// apps = ["/usr/bin/firefox"]
/// ips = ["8.8.8.8", "10.20.0.0/16"]
/// hostnames = ["example.com"]
///
/// [resolver]
/// servers = ["9.9.9.9", "1.1.1.1:53/tcp"]
///
/// [enforcement]
/// backend = "system"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub common: CommonConfig,

    /// The split tunnel policy
    #[serde(default)]
    pub split_tunnel: SplitTunnelConfig,

    /// How hostname exceptions are resolved
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Enforcement backend settings
    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// Static connection snapshot, for running without a VPN client
    pub connection: Option<ConnectionConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.split_tunnel.validate()?;
        self.resolver.validate()?;
        self.enforcement.validate()?;
        Ok(())
    }

    /// Policy described by `[split_tunnel]`
    pub fn policy(&self) -> Result<PolicySettings> {
        let split = &self.split_tunnel;
        Ok(PolicySettings::new(
            split.active,
            split.mode()?,
            &split.apps,
            PolicySettings::parse_ips(&split.ips)?,
            &split.hostnames,
        ))
    }

    /// Connection described by `[connection]`, disconnected if absent
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection
            .as_ref()
            .map(ConnectionConfig::status)
            .unwrap_or_default()
    }

    /// Settings handed to the system enforcement backend
    pub fn backend_config(&self) -> BackendConfig {
        let enforcement = &self.enforcement;
        let defaults = BackendConfig::default();
        BackendConfig {
            table: enforcement.table.clone().unwrap_or(defaults.table),
            routing_table: enforcement.routing_table.unwrap_or(defaults.routing_table),
            fwmark: enforcement.fwmark.unwrap_or(defaults.fwmark),
            classid: defaults.classid,
            cgroup_root: enforcement.cgroup_root.clone().unwrap_or(defaults.cgroup_root),
            route_metric: enforcement.route_metric,
        }
    }

    /// Hostname resolver described by `[resolver]`
    pub fn hostname_resolver(&self) -> Result<HostnameResolver> {
        Ok(HostnameResolver::with_timeout(
            self.resolver.lookup()?,
            self.resolver.timeout(),
        ))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# tunsplit configuration

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

[split_tunnel]
# Enforce split tunneling while the tunnel is up
active = true

# "exclude": listed apps and destinations bypass the tunnel
# "include": only listed apps and destinations use the tunnel
mode = "exclude"

# Executable paths; missing files are skipped
apps = [
    # "/usr/bin/firefox",
]

# IP addresses and CIDR networks
ips = [
    # "8.8.8.8",
    # "10.20.0.0/16",
]

# Hostnames, resolved to addresses whenever the policy or connection changes
hostnames = [
    # "example.com",
]

[resolver]
# Upstream DNS servers for hostname exceptions (empty: system resolver)
# Formats: "IP", "IP:port", "IP[:port]/udp", "IP[:port]/tcp"
servers = []

# Strategy with several servers: "first-reply", "round-robin", "random"
strategy = "first-reply"

# Per-hostname lookup timeout in seconds
timeout_secs = 10

# Also resolve IPv6 (AAAA) addresses
ipv6 = true

[enforcement]
# "system": program routes and firewall (requires root)
# "dry-run": record what would be done and print it
backend = "system"

# Directory holding the client's own executables (default: next to tunsplit)
# install_dir = "/opt/vpn/bin"

# Metric for exception routes
# route_metric = 10

# nftables table, policy routing table and packet mark (Linux)
# table = "tunsplit"
# routing_table = 7473
# fwmark = 29811

# Static connection state, for use without a VPN client
# [connection]
# connected = true
# protocol = "wireguard"   # "openvpn", "ikev2", "wireguard", "stunnel", "wstunnel"
# vpn_ip = "10.8.0.2"
# vpn_gateway = "10.8.0.1"
# default_ip = "192.168.1.20"
# default_gateway = "192.168.1.1"
"#
        .to_string()
    }
}

/// Settings shared by every subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// The `[split_tunnel]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitTunnelConfig {
    #[serde(default)]
    pub active: bool,

    /// `"exclude"` or `"include"`
    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default)]
    pub apps: Vec<PathBuf>,

    /// IP addresses or CIDR networks
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub hostnames: Vec<String>,
}

impl Default for SplitTunnelConfig {
    fn default() -> Self {
        Self {
            active: false,
            mode: default_mode(),
            apps: Vec::new(),
            ips: Vec::new(),
            hostnames: Vec::new(),
        }
    }
}

impl SplitTunnelConfig {
    pub fn validate(&self) -> Result<()> {
        self.mode()?;
        PolicySettings::parse_ips(&self.ips)?;
        Ok(())
    }

    pub fn mode(&self) -> Result<SplitTunnelMode> {
        self.mode.parse()
    }
}

/// The `[resolver]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upstream servers; empty means the system resolver
    #[serde(default)]
    pub servers: Vec<String>,

    /// Upstream selection strategy
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Per-hostname timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Query AAAA records too
    #[serde(default = "default_true")]
    pub ipv6: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            strategy: default_strategy(),
            timeout_secs: default_timeout_secs(),
            ipv6: true,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Config("resolver timeout_secs must be positive".into()));
        }
        self.strategy()?;
        self.parse_servers()?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn strategy(&self) -> Result<UpstreamStrategy> {
        Ok(self.strategy.parse()?)
    }

    /// Parse the server entries
    pub fn parse_servers(&self) -> Result<Vec<DnsServerSpec>> {
        self.servers
            .iter()
            .map(|s| {
                parse_dns_server(s).map_err(|e| {
                    Error::Config(format!("invalid resolver server '{}': {}", s, e))
                })
            })
            .collect()
    }

    /// Build the lookup backend
    pub fn lookup(&self) -> Result<Arc<dyn HostLookup>> {
        let servers = self.parse_servers()?;
        if servers.is_empty() {
            return Ok(Arc::new(SystemLookup));
        }
        let lookup = UpstreamLookup::with_strategy(servers, self.strategy()?)?.with_ipv6(self.ipv6);
        Ok(Arc::new(lookup))
    }
}

/// Which enforcement backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// The platform backend
    #[default]
    System,
    /// Record calls without touching the system
    DryRun,
}

/// The `[enforcement]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Override for own-executable discovery
    #[serde(default)]
    pub install_dir: Option<PathBuf>,

    #[serde(default)]
    pub route_metric: Option<u32>,

    /// nftables table name
    #[serde(default)]
    pub table: Option<String>,

    /// Policy routing table id
    #[serde(default)]
    pub routing_table: Option<u32>,

    /// Packet mark of redirected traffic
    #[serde(default)]
    pub fwmark: Option<u32>,

    /// net_cls hierarchy mount point
    #[serde(default)]
    pub cgroup_root: Option<PathBuf>,
}

impl EnforcementConfig {
    pub fn validate(&self) -> Result<()> {
        if self.routing_table == Some(0) || self.fwmark == Some(0) {
            return Err(Error::Config(
                "routing_table and fwmark must be non-zero".into(),
            ));
        }
        if let Some(ref table) = self.table {
            if table.is_empty() {
                return Err(Error::Config("nftables table name must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// The `[connection]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_true")]
    pub connected: bool,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub vpn_ip: Option<IpAddr>,

    #[serde(default)]
    pub vpn_gateway: Option<IpAddr>,

    #[serde(default)]
    pub default_ip: Option<IpAddr>,

    #[serde(default)]
    pub default_gateway: Option<IpAddr>,
}

impl ConnectionConfig {
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            is_connected: self.connected,
            protocol: self.protocol,
            vpn_adapter: AdapterInfo::new(self.vpn_ip, self.vpn_gateway),
            default_adapter: AdapterInfo::new(self.default_ip, self.default_gateway),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> String {
    "exclude".to_string()
}

fn default_strategy() -> String {
    "first-reply".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

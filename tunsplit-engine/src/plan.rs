//! `(mode, protocol)` dispatch table
//!
//! Exclude mode sends the listed apps around the tunnel, so their traffic and
//! the exceptions go to the physical network's gateway. Include mode sends
//! them into the tunnel; how depends on the protocol: OpenVPN and Stunnel
//! expose a gateway inside the tunnel, IKEv2 and WireGuard only give the
//! adapter its own address. Include mode also shadows the tunnel's default
//! route, so unlisted traffic keeps using the physical network.

use std::net::IpAddr;

use crate::policy::{ConnectionStatus, Protocol, SplitTunnelMode};

/// Where redirected traffic goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSelector {
    DefaultGateway,
    VpnGateway,
    VpnAdapterAddress,
    /// No usable target for this combination
    Unavailable,
}

impl TargetSelector {
    /// Pick the concrete address from the connection state
    pub fn resolve(&self, status: &ConnectionStatus) -> Option<IpAddr> {
        match self {
            TargetSelector::DefaultGateway => status.default_adapter.gateway_ip,
            TargetSelector::VpnGateway => status.vpn_adapter.gateway_ip,
            TargetSelector::VpnAdapterAddress => status.vpn_adapter.ip,
            TargetSelector::Unavailable => None,
        }
    }
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetSelector::DefaultGateway => "default adapter gateway",
            TargetSelector::VpnGateway => "VPN adapter gateway",
            TargetSelector::VpnAdapterAddress => "VPN adapter address",
            TargetSelector::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Whether the client's own executables join the redirected app list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelfExclusion {
    IncludeOwnExecutables,
    ConfiguredOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingPlan {
    pub target: TargetSelector,
    pub self_exclusion: SelfExclusion,
    /// Route everything else around the tunnel through the default gateway
    pub shadow_default_route: bool,
}

pub fn routing_plan(mode: SplitTunnelMode, protocol: Protocol) -> RoutingPlan {
    match mode {
        SplitTunnelMode::Exclude => RoutingPlan {
            target: TargetSelector::DefaultGateway,
            self_exclusion: SelfExclusion::IncludeOwnExecutables,
            shadow_default_route: false,
        },
        SplitTunnelMode::Include => {
            let target = match protocol {
                Protocol::OpenVpn | Protocol::Stunnel => TargetSelector::VpnGateway,
                Protocol::Ikev2 | Protocol::WireGuard => TargetSelector::VpnAdapterAddress,
                Protocol::None => TargetSelector::Unavailable,
            };
            RoutingPlan {
                target,
                self_exclusion: SelfExclusion::ConfiguredOnly,
                shadow_default_route: true,
            }
        }
    }
}

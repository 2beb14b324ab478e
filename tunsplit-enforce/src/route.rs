//! Exception route management
//!
//! Every exception destination gets a host or network route through the
//! redirect target. In include mode two half-space routes through the
//! physical gateway shadow the tunnel's default route. Routes are programmed
//! with the `net-route` crate.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::types::ExceptionSet;

/// A network route entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Gateway address (None for on-link routes)
    pub gateway: Option<IpAddr>,
    /// Route metric/priority (lower = higher priority)
    pub metric: Option<u32>,
}

impl Route {
    /// Create a route to a destination network via a gateway
    pub fn new(destination: IpNet, gateway: IpAddr) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            metric: None,
        }
    }

    /// Create a /32 or /128 route for a single host via a gateway
    pub fn host(addr: IpAddr, gateway: IpAddr) -> Self {
        Self::new(IpNet::from(addr), gateway)
    }

    /// Set the metric for this route
    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Check if destination and gateway belong to the same address family
    pub fn is_consistent(&self) -> bool {
        match self.gateway {
            Some(gw) => gw.is_ipv4() == matches!(self.destination, IpNet::V4(_)),
            None => true,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.destination, IpNet::V4(_))
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {}", metric)?;
        }
        Ok(())
    }
}

/// Routes sending every exception through `gateway`
///
/// Entries of the other address family than the gateway cannot use it and are
/// skipped.
pub fn exception_routes(set: &ExceptionSet, gateway: IpAddr, metric: Option<u32>) -> Vec<Route> {
    set.iter()
        .map(|net| {
            let route = Route::new(*net, gateway);
            match metric {
                Some(m) => route.with_metric(m),
                None => route,
            }
        })
        .filter(|route| {
            let ok = route.is_consistent();
            if !ok {
                log::debug!("Skipping exception route {}: address family mismatch", route);
            }
            ok
        })
        .collect()
}

/// Two half-space routes that outrank a default route through the tunnel
///
/// Only the halves of `gateway`'s address family are returned.
pub fn default_shadow_routes(gateway: IpAddr, metric: Option<u32>) -> Vec<Route> {
    let halves: [&str; 2] = if gateway.is_ipv4() {
        ["0.0.0.0/1", "128.0.0.0/1"]
    } else {
        ["::/1", "8000::/1"]
    };
    halves
        .iter()
        .filter_map(|half| half.parse::<IpNet>().ok())
        .map(|half| {
            let route = Route::new(half, gateway);
            match metric {
                Some(m) => route.with_metric(m),
                None => route,
            }
        })
        .collect()
}

/// Route manager for adding/removing routes
///
/// Uses the `net-route` crate for cross-platform route manipulation.
pub struct RouteManager {
    #[cfg(feature = "async-tokio")]
    handle: net_route::Handle,
}

impl RouteManager {
    /// Create a new route manager
    ///
    /// # Platform Requirements
    ///
    /// - **Linux**: Requires root or `CAP_NET_ADMIN`
    #[cfg(feature = "async-tokio")]
    pub fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;

        Ok(Self { handle })
    }

    #[cfg(feature = "async-tokio")]
    fn to_net_route(route: &Route) -> net_route::Route {
        let mut net_route =
            net_route::Route::new(route.destination.addr(), route.destination.prefix_len());

        if let Some(gw) = route.gateway {
            net_route = net_route.with_gateway(gw);
        }

        #[cfg(any(target_os = "linux", target_os = "windows"))]
        if let Some(metric) = route.metric {
            net_route = net_route.with_metric(metric);
        }

        net_route
    }

    /// Add a route; an already existing identical route is not an error
    #[cfg(feature = "async-tokio")]
    pub async fn add(&self, route: &Route) -> Result<()> {
        let net_route = Self::to_net_route(route);

        match self.handle.add(&net_route).await {
            Ok(()) => {
                log::info!("Added route: {}", route);
            }
            Err(e) => {
                let err_str = e.to_string();
                // EEXIST: route already exists which is fine
                if err_str.contains("File exists") || err_str.contains("os error 17") {
                    log::debug!("Route already exists: {}", route);
                } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                    return Err(Error::PermissionDenied(format!("add route {}: {}", route, e)));
                } else {
                    return Err(Error::Route(format!("failed to add route {}: {}", route, e)));
                }
            }
        }

        Ok(())
    }

    /// Remove a route; a route that is already gone is not an error
    #[cfg(feature = "async-tokio")]
    pub async fn delete(&self, route: &Route) -> Result<()> {
        let net_route = Self::to_net_route(route);

        match self.handle.delete(&net_route).await {
            Ok(()) => {
                log::info!("Deleted route: {}", route);
            }
            Err(e) => {
                let err_str = e.to_string();
                // ESRCH: no such route
                if err_str.contains("No such process") || err_str.contains("os error 3") {
                    log::debug!("Route already absent: {}", route);
                } else {
                    return Err(Error::Route(format!("failed to delete route {}: {}", route, e)));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_route() {
        let route = Route::host("1.1.1.1".parse().unwrap(), "192.168.1.1".parse().unwrap());
        assert_eq!(route.destination, "1.1.1.1/32".parse::<IpNet>().unwrap());
        assert!(route.is_ipv4());
        assert!(route.is_consistent());
    }

    #[test]
    fn test_route_display() {
        let route = Route::new("10.0.0.0/24".parse().unwrap(), "192.168.1.1".parse().unwrap())
            .with_metric(100);

        assert_eq!(route.to_string(), "10.0.0.0/24 via 192.168.1.1 metric 100");
    }

    #[test]
    fn test_default_shadow_routes_follow_gateway_family() {
        let v4 = default_shadow_routes("192.168.1.1".parse().unwrap(), None);
        let dests: Vec<String> = v4.iter().map(|r| r.destination.to_string()).collect();
        assert_eq!(dests, vec!["0.0.0.0/1", "128.0.0.0/1"]);
        assert!(v4.iter().all(Route::is_consistent));

        let v6 = default_shadow_routes("fe80::1".parse().unwrap(), Some(10));
        let dests: Vec<String> = v6.iter().map(|r| r.destination.to_string()).collect();
        assert_eq!(dests, vec!["::/1", "8000::/1"]);
        assert!(v6.iter().all(|r| r.metric == Some(10)));
    }

    #[test]
    fn test_exception_routes_skip_other_family() {
        let set: ExceptionSet = [
            "8.8.8.8/32".parse().unwrap(),
            "2001:4860:4860::8888/128".parse().unwrap(),
            "100.64.0.0/10".parse().unwrap(),
        ]
        .into_iter()
        .collect();

        let routes = exception_routes(&set, "192.168.1.1".parse().unwrap(), Some(5));
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.is_ipv4() && r.metric == Some(5)));
        assert_eq!(routes[0].destination, "8.8.8.8/32".parse::<IpNet>().unwrap());
    }
}

//! Backend selection and settings

use std::path::PathBuf;
use std::sync::Arc;

use crate::adapter::EnforcementAdapter;
use crate::error::Result;

/// Default mount point of the net_cls v1 hierarchy
pub const DEFAULT_NET_CLS_ROOT: &str = "/sys/fs/cgroup/net_cls";

/// Settings of the system enforcement backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// nftables table (family `inet`) owned by the adapter
    pub table: String,
    /// Policy routing table for redirected traffic
    pub routing_table: u32,
    /// Packet mark selecting the policy routing table
    pub fwmark: u32,
    /// net_cls class id of the redirect cgroup
    pub classid: u32,
    /// Mount point of the net_cls hierarchy
    pub cgroup_root: PathBuf,
    /// Metric for exception routes
    pub route_metric: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            table: "tunsplit".to_string(),
            routing_table: 7473,
            fwmark: 0x7473,
            classid: 0x0011_0011,
            cgroup_root: PathBuf::from(DEFAULT_NET_CLS_ROOT),
            route_metric: None,
        }
    }
}

/// Create the enforcement adapter for the running platform
///
/// On platforms without a backend this returns an adapter whose operations
/// all fail with `NotSupported`.
pub fn system_adapter(config: &BackendConfig) -> Result<Arc<dyn EnforcementAdapter>> {
    #[cfg(all(target_os = "linux", feature = "async-tokio"))]
    {
        Ok(Arc::new(crate::linux::LinuxAdapter::new(config.clone())?))
    }

    #[cfg(not(all(target_os = "linux", feature = "async-tokio")))]
    {
        let _ = config;
        log::warn!(
            "No split tunnel backend for {}, enforcement will fail",
            std::env::consts::OS
        );
        Ok(Arc::new(crate::stub::UnsupportedAdapter::new()))
    }
}

//! Stub adapter for platforms without an enforcement backend

use std::net::IpAddr;

use async_trait::async_trait;

use crate::adapter::EnforcementAdapter;
use crate::error::{Error, Result};
use crate::route::Route;
use crate::types::{AppIdentitySet, ExceptionSet};

/// Adapter whose every operation fails with [`Error::NotSupported`]
#[derive(Debug, Default)]
pub struct UnsupportedAdapter;

impl UnsupportedAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn unsupported<T>(what: &str) -> Result<T> {
    Err(Error::NotSupported(format!(
        "{} is not available on {}",
        what,
        std::env::consts::OS
    )))
}

#[async_trait]
impl EnforcementAdapter for UnsupportedAdapter {
    fn name(&self) -> &str {
        "unsupported"
    }

    async fn enable_redirect(&self, _target: IpAddr, _apps: &AppIdentitySet) -> Result<()> {
        unsupported("per-app redirect")
    }

    async fn disable_redirect(&self) -> Result<()> {
        unsupported("per-app redirect")
    }

    async fn set_exception_addresses(&self, _set: &ExceptionSet) -> Result<()> {
        unsupported("firewall exceptions")
    }

    async fn add_route(&self, _route: &Route) -> Result<()> {
        unsupported("route management")
    }

    async fn remove_route(&self, _route: &Route) -> Result<()> {
        unsupported("route management")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_operations_unsupported() {
        let adapter = UnsupportedAdapter::new();
        let target: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(adapter
            .enable_redirect(target, &AppIdentitySet::new())
            .await
            .unwrap_err()
            .is_not_supported());
        assert!(adapter.disable_redirect().await.unwrap_err().is_not_supported());
        assert!(adapter
            .set_exception_addresses(&ExceptionSet::new())
            .await
            .unwrap_err()
            .is_not_supported());
        assert!(adapter
            .add_route(&Route::host("1.1.1.1".parse().unwrap(), target))
            .await
            .unwrap_err()
            .is_not_supported());

        // The auxiliary service hooks fall back to no-ops
        adapter.start_service().await.unwrap();
        adapter.stop_service().await.unwrap();
    }
}

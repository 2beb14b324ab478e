//! The enforcement adapter abstraction
//!
//! An adapter owns the platform primitives split tunneling is built from:
//! the per-app redirect, the firewall exception set, and exception routes.
//! The controller is the only writer; it serializes every call and only
//! issues a call when the requested state differs from what it installed.
//!
//! All operations must be idempotent: enabling an already enabled redirect
//! with the same arguments, or removing a route that is gone, succeeds.
//!
//! The OS resources an adapter touches are assumed to belong exclusively to
//! one controller session. Running two controllers against the same tables
//! or cgroups is not supported.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::route::Route;
use crate::types::{AppIdentitySet, ExceptionSet};

#[async_trait]
pub trait EnforcementAdapter: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Start whatever auxiliary service the backend depends on
    async fn start_service(&self) -> Result<()> {
        Ok(())
    }

    /// Stop the auxiliary service
    async fn stop_service(&self) -> Result<()> {
        Ok(())
    }

    /// Send traffic of `apps` (or, for an empty set, no app) via `target`
    ///
    /// Calling this again replaces the previous target and app list.
    async fn enable_redirect(&self, target: IpAddr, apps: &AppIdentitySet) -> Result<()>;

    /// Remove the per-app redirect
    async fn disable_redirect(&self) -> Result<()>;

    /// Replace the firewall exception set with `set`
    async fn set_exception_addresses(&self, set: &ExceptionSet) -> Result<()>;

    async fn add_route(&self, route: &Route) -> Result<()>;

    async fn remove_route(&self, route: &Route) -> Result<()>;
}

//! Enforcement primitives for split tunneling
//!
//! This crate defines what a split tunnel controller can ask of the
//! operating system, and ships the backends that do it.
//!
//! # Features
//!
//! - **Enforcement trait**: [`EnforcementAdapter`] with redirect, exception
//!   set, route, and auxiliary service operations
//! - **Shared types**: [`ExceptionSet`], [`AppId`], [`AppIdentitySet`], [`Route`]
//! - **Linux backend**: routes via `net-route`, nftables exception sets, and a
//!   cgroup + fwmark + policy routing redirect
//! - **Recording backend**: in-memory [`mock::RecordingAdapter`] for tests and dry runs
//!
//! # Feature Flags
//!
//! - `async-tokio` (default): route management through `net-route`; required
//!   by the Linux backend
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN`
//! - `nft` and `ip` (iproute2) in `PATH`
//! - net_cls cgroup v1 hierarchy mounted (default `/sys/fs/cgroup/net_cls`)
//!
//! Other platforms get [`UnsupportedAdapter`].
//!
//! # Example
//!
//! ```ignore
//! use tunsplit_enforce::{system_adapter, BackendConfig, ExceptionSet, Route};
//!
//! let adapter = system_adapter(&BackendConfig::default())?;
//! let gateway = "192.168.1.1".parse()?;
//!
//! let mut set = ExceptionSet::new();
//! set.insert_addr("8.8.8.8".parse()?);
//! adapter.set_exception_addresses(&set).await?;
//! adapter.add_route(&Route::host("8.8.8.8".parse()?, gateway)).await?;
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod mock;
pub mod route;
pub mod stub;
pub mod types;

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
pub mod linux;

pub use adapter::EnforcementAdapter;
pub use config::{system_adapter, BackendConfig, DEFAULT_NET_CLS_ROOT};
pub use error::{Error, Result};
pub use route::{default_shadow_routes, exception_routes, Route, RouteManager};
pub use stub::UnsupportedAdapter;
pub use types::{is_sentinel_net, AppId, AppIdentitySet, ExceptionSet};

#[cfg(all(target_os = "linux", feature = "async-tokio"))]
pub use linux::LinuxAdapter;

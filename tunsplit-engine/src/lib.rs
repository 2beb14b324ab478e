//! tunsplit engine
//!
//! This crate decides what split tunneling should enforce and drives an
//! enforcement backend to get there. It is meant to be embedded in a VPN
//! client, which feeds it the user's policy and the tunnel state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │  tunsplit-cli   │              │     VPN client      │   │
//! │  └────────┬────────┘              └──────────┬──────────┘   │
//! │           └───────────────┬──────────────────┘              │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                  tunsplit-engine                       │ │
//! │  │  - SplitTunnelController (main interface)              │ │
//! │  │  - routing plan, exception sets, app identities        │ │
//! │  │  - Config (TOML configuration), events                 │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌─────────────────┐    ┌──────────────────────┐            │
//! │  │  tunsplit-dns   │    │   tunsplit-enforce   │            │
//! │  │  - Lookups      │    │  - Routes            │            │
//! │  │  - Rounds       │    │  - Firewall sets     │            │
//! │  │                 │    │  - Per-app redirect  │            │
//! │  └─────────────────┘    └──────────────────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunsplit_dns::{HostnameResolver, SystemLookup};
//! use tunsplit_enforce::mock::RecordingAdapter;
//! use tunsplit_engine::{
//!     AdapterInfo, ConnectionStatus, PolicySettings, Protocol, SplitTunnelController,
//!     SplitTunnelMode,
//! };
//!
//! # async fn example() {
//! let resolver = Arc::new(HostnameResolver::new(Arc::new(SystemLookup)));
//! let controller = SplitTunnelController::new(Arc::new(RecordingAdapter::new()), resolver);
//!
//! controller
//!     .set_settings(PolicySettings::new(
//!         true,
//!         SplitTunnelMode::Exclude,
//!         ["/usr/bin/firefox"],
//!         ["8.8.8.8/32".parse().unwrap()],
//!         ["example.com"],
//!     ))
//!     .await;
//! controller
//!     .set_connection_status(ConnectionStatus::connected(
//!         Protocol::WireGuard,
//!         AdapterInfo::new(Some("10.8.0.2".parse().unwrap()), None),
//!         AdapterInfo::new(None, Some("192.168.1.1".parse().unwrap())),
//!     ))
//!     .await;
//!
//! controller.shutdown().await;
//! # }
//! ```

pub mod apps;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod exceptions;
pub mod plan;
pub mod policy;

pub use config::{Backend, Config};
pub use controller::{ControllerStatus, SplitTunnelController};
pub use error::{Error, Result};
pub use event::{CollectingEventHandler, EventHandler, LoggingEventHandler, SplitTunnelEvent};
pub use exceptions::build_exception_set;
pub use plan::{routing_plan, RoutingPlan, SelfExclusion, TargetSelector};
pub use policy::{AdapterInfo, ConnectionStatus, PolicySettings, Protocol, SplitTunnelMode};

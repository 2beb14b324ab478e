//! tunsplit-dns - hostname resolution for split tunnel exceptions
//!
//! Hostname exceptions are turned into addresses in *rounds*: a round resolves
//! every configured hostname concurrently and reports the full batch once.
//! Rounds can be superseded or cancelled at any time, which is what the
//! split tunnel controller does whenever the policy or connection changes.
//!
//! Lookups go through a [`HostLookup`] backend:
//! - [`SystemLookup`] uses the operating system resolver
//! - [`UpstreamLookup`] queries explicit UDP/TCP DNS servers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunsplit_dns::{parse_dns_server, HostnameResolver, UpstreamLookup};
//!
//! # async fn example() -> tunsplit_dns::Result<()> {
//! let lookup = UpstreamLookup::new(vec![parse_dns_server("9.9.9.9")?])?;
//! let resolver = HostnameResolver::new(Arc::new(lookup));
//!
//! resolver.resolve_domains(["api.example.com"], |batch| {
//!     for host in batch.hosts.values() {
//!         println!("{} -> {:?}", host.hostname, host.addresses);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

mod config;
pub mod error;
mod lookup;
mod resolver;

pub use config::{parse_dns_server, DnsServerSpec, UpstreamStrategy};
pub use error::{Error, Result};
pub use lookup::{HostLookup, SystemLookup, UpstreamLookup};
pub use resolver::{
    is_blocked_sentinel, HostnameResolver, ResolutionBatch, ResolvedHost, RoundId,
    BLOCKED_SENTINEL, DEFAULT_LOOKUP_TIMEOUT,
};

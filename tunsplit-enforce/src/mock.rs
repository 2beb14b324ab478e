//! In-memory enforcement adapter
//!
//! [`RecordingAdapter`] keeps the state a real backend would program and logs
//! every call, so tests can assert both the end result and that redundant
//! calls were suppressed. It also backs the CLI's dry-run mode.
//!
//! # Example
//!
//! ```
//! use tunsplit_enforce::mock::{AdapterCall, Operation, RecordingAdapter};
//! use tunsplit_enforce::{AppIdentitySet, EnforcementAdapter};
//!
//! # async fn example() {
//! let adapter = RecordingAdapter::new();
//! adapter.fail_on(Operation::EnableRedirect);
//!
//! let target = "192.168.1.1".parse().unwrap();
//! assert!(adapter.enable_redirect(target, &AppIdentitySet::new()).await.is_err());
//! assert!(adapter.state().redirect.is_none());
//! assert!(matches!(adapter.calls()[0], AdapterCall::EnableRedirect { .. }));
//! # }
//! ```

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::adapter::EnforcementAdapter;
use crate::error::{Error, Result};
use crate::route::Route;
use crate::types::{AppIdentitySet, ExceptionSet};

/// Adapter operations, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartService,
    StopService,
    EnableRedirect,
    DisableRedirect,
    SetExceptionAddresses,
    AddRoute,
    RemoveRoute,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::StartService => "start_service",
            Operation::StopService => "stop_service",
            Operation::EnableRedirect => "enable_redirect",
            Operation::DisableRedirect => "disable_redirect",
            Operation::SetExceptionAddresses => "set_exception_addresses",
            Operation::AddRoute => "add_route",
            Operation::RemoveRoute => "remove_route",
        };
        f.write_str(name)
    }
}

/// One recorded adapter call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    StartService,
    StopService,
    EnableRedirect { target: IpAddr, apps: Vec<PathBuf> },
    DisableRedirect,
    SetExceptionAddresses(Vec<IpNet>),
    AddRoute(Route),
    RemoveRoute(Route),
}

impl AdapterCall {
    pub fn operation(&self) -> Operation {
        match self {
            AdapterCall::StartService => Operation::StartService,
            AdapterCall::StopService => Operation::StopService,
            AdapterCall::EnableRedirect { .. } => Operation::EnableRedirect,
            AdapterCall::DisableRedirect => Operation::DisableRedirect,
            AdapterCall::SetExceptionAddresses(_) => Operation::SetExceptionAddresses,
            AdapterCall::AddRoute(_) => Operation::AddRoute,
            AdapterCall::RemoveRoute(_) => Operation::RemoveRoute,
        }
    }
}

/// What the adapter currently has installed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedState {
    pub service_running: bool,
    pub redirect: Option<(IpAddr, AppIdentitySet)>,
    pub exceptions: ExceptionSet,
    pub routes: BTreeSet<Route>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<AdapterCall>,
    state: RecordedState,
    failing: HashSet<Operation>,
}

/// Enforcement adapter that records calls instead of touching the system
#[derive(Default)]
pub struct RecordingAdapter {
    inner: Mutex<Inner>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent `op` call fail without changing state
    pub fn fail_on(&self, op: Operation) {
        self.lock().failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Snapshot of every call so far, in order
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn count_of(&self, op: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation() == op)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Snapshot of the installed state
    pub fn state(&self) -> RecordedState {
        self.lock().state.clone()
    }

    /// Record `call` and apply `f` to the state unless `op` is set to fail
    fn record<F>(&self, call: AdapterCall, f: F) -> Result<()>
    where
        F: FnOnce(&mut RecordedState),
    {
        let mut inner = self.lock();
        let op = call.operation();
        log::debug!("[recording] {:?}", call);
        inner.calls.push(call);
        if inner.failing.contains(&op) {
            return Err(Error::Simulated(op.to_string()));
        }
        f(&mut inner.state);
        Ok(())
    }
}

#[async_trait]
impl EnforcementAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn start_service(&self) -> Result<()> {
        self.record(AdapterCall::StartService, |s| s.service_running = true)
    }

    async fn stop_service(&self) -> Result<()> {
        self.record(AdapterCall::StopService, |s| s.service_running = false)
    }

    async fn enable_redirect(&self, target: IpAddr, apps: &AppIdentitySet) -> Result<()> {
        let call = AdapterCall::EnableRedirect {
            target,
            apps: apps.paths(),
        };
        let apps = apps.clone();
        self.record(call, move |s| s.redirect = Some((target, apps)))
    }

    async fn disable_redirect(&self) -> Result<()> {
        self.record(AdapterCall::DisableRedirect, |s| s.redirect = None)
    }

    async fn set_exception_addresses(&self, set: &ExceptionSet) -> Result<()> {
        let call = AdapterCall::SetExceptionAddresses(set.iter().copied().collect());
        let set = set.clone();
        self.record(call, move |s| s.exceptions = set)
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        let added = route.clone();
        self.record(AdapterCall::AddRoute(route.clone()), move |s| {
            s.routes.insert(added);
        })
    }

    async fn remove_route(&self, route: &Route) -> Result<()> {
        self.record(AdapterCall::RemoveRoute(route.clone()), |s| {
            s.routes.remove(route);
        })
    }
}

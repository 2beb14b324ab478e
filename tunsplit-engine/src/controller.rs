//! Split tunnel controller
//!
//! The controller owns the policy and the connection status and, whenever
//! either changes, recomputes what should be enforced and pushes the
//! difference to an [`EnforcementAdapter`]. Hostname exceptions are resolved
//! in the background; every recomputation starts a fresh resolution round
//! and results from older rounds are dropped.
//!
//! All entry points serialize on one lock that is held across adapter calls.
//! Resolution results arrive on a spawned task that takes the same lock.
//!
//! The controller must be shut down with [`SplitTunnelController::shutdown`]
//! before it is dropped. Dropping it while enforcement is installed panics.
//!
//! The OS resources an adapter touches must belong to a single controller.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use tunsplit_dns::{HostnameResolver, ResolutionBatch, ResolvedHost, RoundId};
use tunsplit_enforce::{
    default_shadow_routes, exception_routes, AppIdentitySet, EnforcementAdapter, ExceptionSet,
    Route,
};

use crate::apps::{current_install_dir, detect_own_executables};
use crate::config::Config;
use crate::error::Result;
use crate::event::{EventHandler, LoggingEventHandler, SplitTunnelEvent};
use crate::exceptions::build_exception_set;
use crate::plan::{routing_plan, SelfExclusion};
use crate::policy::{ConnectionStatus, PolicySettings, Protocol, SplitTunnelMode};

/// What the controller last pushed to the adapter successfully
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct InstalledState {
    service_running: bool,
    redirect: Option<(IpAddr, AppIdentitySet)>,
    exceptions: ExceptionSet,
    routes: BTreeSet<Route>,
}

impl InstalledState {
    fn is_empty(&self) -> bool {
        !self.service_running
            && self.redirect.is_none()
            && self.exceptions.is_empty()
            && self.routes.is_empty()
    }
}

#[derive(Default)]
struct ControllerState {
    policy: PolicySettings,
    connection: ConnectionStatus,
    installed: InstalledState,
    /// Redirect target while enforcing
    target: Option<IpAddr>,
    /// Half-space routes wanted on top of the exception routes
    shadow_routes: BTreeSet<Route>,
    /// Round whose results will be accepted
    current_round: Option<RoundId>,
    /// Latest accepted result per configured hostname
    resolutions: HashMap<String, ResolvedHost>,
    /// Client executables, detected once
    own_executables: Option<AppIdentitySet>,
    last_error: Option<String>,
    shut_down: bool,
}

/// Snapshot of the controller, see [`SplitTunnelController::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Enforcement is installed
    pub enforcing: bool,
    /// The policy asks for split tunneling
    pub active: bool,
    pub connected: bool,
    pub mode: SplitTunnelMode,
    pub protocol: Protocol,
    pub redirect_target: Option<IpAddr>,
    /// Exception set currently installed
    pub exceptions: ExceptionSet,
    /// Number of routes currently installed, shadow routes included
    pub routes: usize,
    pub current_round: Option<RoundId>,
    /// Most recent enforcement error, cleared on the next recomputation
    pub last_error: Option<String>,
}

/// State shared with resolution delivery tasks
#[derive(Clone)]
struct Core {
    adapter: Arc<dyn EnforcementAdapter>,
    events: Arc<dyn EventHandler>,
    state: Arc<Mutex<ControllerState>>,
    enforcing: Arc<AtomicBool>,
}

/// Split tunnel controller
pub struct SplitTunnelController {
    core: Core,
    resolver: Arc<HostnameResolver>,
    install_dir: Option<PathBuf>,
}

impl SplitTunnelController {
    /// Create a controller with default (inactive, disconnected) state
    pub fn new(adapter: Arc<dyn EnforcementAdapter>, resolver: Arc<HostnameResolver>) -> Self {
        log::debug!(
            "Split tunnel controller created (adapter: {}, lookup: {})",
            adapter.name(),
            resolver.lookup_name()
        );
        Self {
            core: Core {
                adapter,
                events: Arc::new(LoggingEventHandler),
                state: Arc::new(Mutex::new(ControllerState::default())),
                enforcing: Arc::new(AtomicBool::new(false)),
            },
            resolver,
            install_dir: None,
        }
    }

    /// Create a controller from configuration, driving `adapter`
    ///
    /// The policy and connection are not applied; feed them through
    /// [`set_settings`](Self::set_settings) and
    /// [`set_connection_status`](Self::set_connection_status).
    pub fn from_config(config: &Config, adapter: Arc<dyn EnforcementAdapter>) -> Result<Self> {
        let resolver = Arc::new(config.hostname_resolver()?);
        let controller = Self::new(adapter, resolver);
        Ok(match config.enforcement.install_dir {
            Some(ref dir) => controller.with_install_dir(dir),
            None => controller,
        })
    }

    /// Set a custom event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.core.events = handler;
        self
    }

    /// Directory scanned for the client's own executables
    ///
    /// Defaults to the directory of the running executable.
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    /// Replace the policy and recompute
    pub async fn set_settings(&self, policy: PolicySettings) {
        let mut state = self.core.state.lock().await;
        log::info!(
            "Split tunnel settings: active={}, mode={}, {} app(s), {} ip(s), {} hostname(s)",
            policy.active,
            policy.mode,
            policy.apps.len(),
            policy.ips.len(),
            policy.hostnames.len()
        );
        state.policy = policy;
        self.update_state(&mut state).await;
    }

    /// Replace the connection status and recompute
    ///
    /// An unchanged status is ignored unless the last recomputation failed.
    pub async fn set_connection_status(&self, status: ConnectionStatus) {
        let mut state = self.core.state.lock().await;
        if state.connection == status && state.last_error.is_none() {
            log::debug!("Connection status unchanged, nothing to do");
            return;
        }
        log::info!(
            "Connection status: connected={}, protocol={}",
            status.is_connected,
            status.protocol
        );
        state.connection = status;
        self.update_state(&mut state).await;
    }

    /// Remove all enforcement; afterwards the controller may be dropped
    ///
    /// Later updates are still recorded but never enforce again. If a
    /// teardown step fails the controller keeps enforcing, and calling this
    /// again retries what is left.
    pub async fn shutdown(&self) {
        let mut state = self.core.state.lock().await;
        if state.shut_down && state.installed.is_empty() {
            return;
        }
        log::info!("Shutting down split tunnel controller");
        state.shut_down = true;
        self.update_state(&mut state).await;
    }

    pub async fn status(&self) -> ControllerStatus {
        let state = self.core.state.lock().await;
        ControllerStatus {
            enforcing: self.is_enforcing(),
            active: state.policy.active,
            connected: state.connection.is_connected,
            mode: state.policy.mode,
            protocol: state.connection.protocol,
            redirect_target: state.installed.redirect.as_ref().map(|(target, _)| *target),
            exceptions: state.installed.exceptions.clone(),
            routes: state.installed.routes.len(),
            current_round: state.current_round,
            last_error: state.last_error.clone(),
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.core.enforcing.load(Ordering::SeqCst)
    }

    pub async fn policy(&self) -> PolicySettings {
        self.core.state.lock().await.policy.clone()
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.core.state.lock().await.connection
    }

    /// Recompute and enforce from the current policy and connection
    async fn update_state(&self, state: &mut ControllerState) {
        state.last_error = None;

        let wanted = state.connection.is_connected && state.policy.active && !state.shut_down;
        if !wanted {
            let reason = if state.shut_down {
                "shutdown"
            } else if !state.connection.is_connected {
                "tunnel disconnected"
            } else {
                "split tunneling inactive"
            };
            self.disable(state, reason).await;
            return;
        }

        let mode = state.policy.mode;
        let protocol = state.connection.protocol;
        let plan = routing_plan(mode, protocol);

        let target = match plan.target.resolve(&state.connection) {
            Some(target) => target,
            None => {
                let message = format!(
                    "no redirect target for mode={} protocol={} ({})",
                    mode, protocol, plan.target
                );
                log::error!("Cannot enable split tunnel: {}", message);
                self.core
                    .events
                    .on_event(SplitTunnelEvent::TargetUnavailable { mode, protocol })
                    .await;
                self.disable(state, "no redirect target").await;
                state.last_error = Some(message);
                return;
            }
        };

        let mut apps = AppIdentitySet::set_from_list(&state.policy.apps);
        if plan.self_exclusion == SelfExclusion::IncludeOwnExecutables {
            apps.add_from(self.own_executables(state));
        }

        log::debug!(
            "Enforcing split tunnel: mode={}, target={} ({}), {} app(s)",
            mode,
            target,
            plan.target,
            apps.len()
        );

        state.shadow_routes = if plan.shadow_default_route {
            match state.connection.default_adapter.gateway_ip {
                Some(gateway) => default_shadow_routes(gateway, None).into_iter().collect(),
                None => {
                    log::warn!("Default gateway unknown, tunnel default route not shadowed");
                    BTreeSet::new()
                }
            }
        } else {
            BTreeSet::new()
        };

        self.core.enforcing.store(true, Ordering::SeqCst);
        state.target = Some(target);

        self.core.ensure_service(state).await;
        self.core.apply_redirect(state, mode, target, apps).await;

        // Keep earlier results only for hostnames that are still configured
        let hostnames = &state.policy.hostnames;
        state.resolutions.retain(|name, _| hostnames.contains(name));
        self.core.apply_exceptions(state, target).await;

        self.start_resolution(state).await;
    }

    /// Cancel resolution, then tear down everything that is installed
    async fn disable(&self, state: &mut ControllerState, reason: &str) {
        self.resolver.cancel_all();
        state.current_round = None;
        state.target = None;
        state.shadow_routes.clear();

        let was_installed = !state.installed.is_empty();
        let core = &self.core;

        if state.installed.redirect.is_some() {
            match core.adapter.disable_redirect().await {
                Ok(()) => state.installed.redirect = None,
                Err(e) => core.report(state, "disable_redirect", e).await,
            }
        }

        core.sync_routes(state, BTreeSet::new()).await;

        if !state.installed.exceptions.is_empty() {
            match core.adapter.set_exception_addresses(&ExceptionSet::new()).await {
                Ok(()) => state.installed.exceptions = ExceptionSet::new(),
                Err(e) => core.report(state, "set_exception_addresses", e).await,
            }
        }

        if state.installed.service_running {
            match core.adapter.stop_service().await {
                Ok(()) => state.installed.service_running = false,
                Err(e) => core.report(state, "stop_service", e).await,
            }
        }

        if state.installed.is_empty() {
            core.enforcing.store(false, Ordering::SeqCst);
        } else {
            log::warn!("Split tunnel teardown incomplete, still enforcing");
        }

        if was_installed {
            log::info!("Split tunnel disabled: {}", reason);
            core.events
                .on_event(SplitTunnelEvent::Disabled {
                    reason: reason.to_string(),
                })
                .await;
        } else {
            log::debug!("Split tunnel stays disabled: {}", reason);
        }
    }

    fn own_executables<'a>(&self, state: &'a mut ControllerState) -> &'a AppIdentitySet {
        let install_dir = &self.install_dir;
        state.own_executables.get_or_insert_with(|| {
            match install_dir.clone().or_else(current_install_dir) {
                Some(dir) => {
                    let own = detect_own_executables(&dir);
                    log::info!(
                        "Found {} client executable(s) in {}",
                        own.len(),
                        dir.display()
                    );
                    own
                }
                None => {
                    log::warn!("Client install directory unknown, own executables not excluded");
                    AppIdentitySet::new()
                }
            }
        })
    }

    /// Supersede any running round and resolve the configured hostnames
    async fn start_resolution(&self, state: &mut ControllerState) {
        self.resolver.cancel_all();
        state.current_round = None;

        if state.policy.hostnames.is_empty() {
            return;
        }

        let core = self.core.clone();
        let hostnames: Vec<String> = state.policy.hostnames.iter().cloned().collect();
        let count = hostnames.len();
        let round = self.resolver.resolve_domains(hostnames, move |batch| {
            tokio::spawn(async move { core.deliver(batch).await });
        });
        state.current_round = Some(round);

        log::debug!("Resolving {} hostname(s) in round {}", count, round);
        self.core
            .events
            .on_event(SplitTunnelEvent::ResolutionStarted {
                round,
                hostnames: count,
            })
            .await;
    }
}

impl Core {
    /// Accept the results of a finished round, unless it was superseded
    async fn deliver(self, batch: ResolutionBatch) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let round = batch.round;
        if state.current_round != Some(round) {
            log::debug!("Discarding results of superseded round {}", round);
            self.events
                .on_event(SplitTunnelEvent::StaleResolutionDiscarded { round })
                .await;
            return;
        }

        let failed = batch.failed_count();
        let resolved = batch.hosts.len() - failed;
        log::info!(
            "Resolution round {} complete: {} resolved, {} failed",
            round,
            resolved,
            failed
        );

        let hostnames = &state.policy.hostnames;
        state.resolutions = batch
            .hosts
            .into_iter()
            .filter(|(name, _)| hostnames.contains(name))
            .collect();

        self.events
            .on_event(SplitTunnelEvent::ResolutionCompleted {
                round,
                resolved,
                failed,
            })
            .await;

        if let Some(target) = state.target {
            self.apply_exceptions(state, target).await;
        }
    }

    async fn ensure_service(&self, state: &mut ControllerState) {
        if state.installed.service_running {
            return;
        }
        match self.adapter.start_service().await {
            Ok(()) => state.installed.service_running = true,
            Err(e) => self.report(state, "start_service", e).await,
        }
    }

    async fn apply_redirect(
        &self,
        state: &mut ControllerState,
        mode: SplitTunnelMode,
        target: IpAddr,
        apps: AppIdentitySet,
    ) {
        if let Some((installed_target, installed_apps)) = &state.installed.redirect {
            if *installed_target == target && *installed_apps == apps {
                return;
            }
        }

        match self.adapter.enable_redirect(target, &apps).await {
            Ok(()) => {
                let count = apps.len();
                state.installed.redirect = Some((target, apps));
                self.events
                    .on_event(SplitTunnelEvent::Enabled {
                        mode,
                        target,
                        apps: count,
                    })
                    .await;
            }
            Err(e) => self.report(state, "enable_redirect", e).await,
        }
    }

    /// Install the exception set built from literals and accepted resolutions
    async fn apply_exceptions(&self, state: &mut ControllerState, target: IpAddr) {
        let set = build_exception_set(&state.policy.ips, state.resolutions.values());

        if set != state.installed.exceptions {
            match self.adapter.set_exception_addresses(&set).await {
                Ok(()) => {
                    log::info!("Exception set: {}", set);
                    let count = set.len();
                    state.installed.exceptions = set.clone();
                    self.events
                        .on_event(SplitTunnelEvent::ExceptionsUpdated { count })
                        .await;
                }
                Err(e) => self.report(state, "set_exception_addresses", e).await,
            }
        }

        let mut routes: BTreeSet<Route> = exception_routes(&set, target, None).into_iter().collect();
        routes.extend(state.shadow_routes.iter().cloned());
        self.sync_routes(state, routes).await;
    }

    /// Remove stale routes, then add missing ones
    async fn sync_routes(&self, state: &mut ControllerState, wanted: BTreeSet<Route>) {
        let stale: Vec<Route> = state.installed.routes.difference(&wanted).cloned().collect();
        for route in stale {
            match self.adapter.remove_route(&route).await {
                Ok(()) => {
                    state.installed.routes.remove(&route);
                }
                Err(e) => self.report(state, "remove_route", e).await,
            }
        }

        let missing: Vec<Route> = wanted.difference(&state.installed.routes).cloned().collect();
        for route in missing {
            match self.adapter.add_route(&route).await {
                Ok(()) => {
                    state.installed.routes.insert(route);
                }
                Err(e) => self.report(state, "add_route", e).await,
            }
        }
    }

    /// Record a failed adapter call; enforcement carries on with the rest
    async fn report(&self, state: &mut ControllerState, operation: &str, error: tunsplit_enforce::Error) {
        log::error!("Split tunnel {} failed on {}: {}", operation, self.adapter.name(), error);
        let message = format!("{}: {}", operation, error);
        state.last_error = Some(message.clone());
        self.events
            .on_event(SplitTunnelEvent::EnforcementFailed {
                operation: operation.to_string(),
                message,
            })
            .await;
    }
}

/// Panics if enforcement is still installed, including after a shutdown whose
/// teardown failed part way.
impl Drop for SplitTunnelController {
    fn drop(&mut self) {
        assert!(
            !self.is_enforcing() || std::thread::panicking(),
            "split tunnel controller dropped while enforcing; call shutdown() first"
        );
    }
}

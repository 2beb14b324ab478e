//! Resolution rounds
//!
//! A round resolves a batch of hostnames concurrently and hands the whole
//! result map to a callback exactly once. Starting a new round supersedes
//! the previous one, and [`HostnameResolver::cancel_all`] invalidates every
//! round in flight: after it returns no earlier callback will run.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};

use crate::lookup::HostLookup;

/// Identifier of a resolution round, strictly increasing per resolver
pub type RoundId = u64;

/// Default time budget for a single hostname lookup
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Address some resolvers return for names they refuse to resolve
pub const BLOCKED_SENTINEL: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Check whether an address is the "blocked" sentinel rather than a real host
pub fn is_blocked_sentinel(ip: &IpAddr) -> bool {
    *ip == BLOCKED_SENTINEL
}

/// Outcome of resolving one hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub hostname: String,
    pub addresses: BTreeSet<IpAddr>,
    /// The lookup failed, `addresses` is empty
    pub error: bool,
}

impl ResolvedHost {
    pub fn resolved(hostname: impl Into<String>, addresses: BTreeSet<IpAddr>) -> Self {
        Self {
            hostname: hostname.into(),
            addresses,
            error: false,
        }
    }

    pub fn failed(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            addresses: BTreeSet::new(),
            error: true,
        }
    }

    /// Addresses that may become exceptions (the blocked sentinel is dropped)
    pub fn usable_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addresses
            .iter()
            .copied()
            .filter(|ip| !is_blocked_sentinel(ip))
    }
}

/// All results of one round, keyed by hostname
#[derive(Debug, Clone, Default)]
pub struct ResolutionBatch {
    pub round: RoundId,
    pub hosts: HashMap<String, ResolvedHost>,
}

impl ResolutionBatch {
    pub fn failed_count(&self) -> usize {
        self.hosts.values().filter(|h| h.error).count()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[derive(Default)]
struct RoundState {
    /// Last round handed out
    latest: RoundId,
    /// Every round up to and including this one has been cancelled
    cancelled_through: RoundId,
    tasks: Vec<JoinHandle<()>>,
}

impl RoundState {
    fn is_current(&self, round: RoundId) -> bool {
        round == self.latest && round > self.cancelled_through
    }
}

/// Asynchronous hostname resolver with round-based cancellation
pub struct HostnameResolver {
    lookup: Arc<dyn HostLookup>,
    timeout: Duration,
    state: Arc<Mutex<RoundState>>,
}

impl HostnameResolver {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self::with_timeout(lookup, DEFAULT_LOOKUP_TIMEOUT)
    }

    pub fn with_timeout(lookup: Arc<dyn HostLookup>, timeout: Duration) -> Self {
        Self {
            lookup,
            timeout,
            state: Arc::new(Mutex::new(RoundState::default())),
        }
    }

    pub fn lookup_name(&self) -> String {
        self.lookup.name()
    }

    /// Start resolving `hostnames`; `on_resolved` runs once with the full batch
    ///
    /// The callback is skipped if the round is superseded or cancelled before it
    /// completes. It runs while the resolver's round lock is held, so it must not
    /// call back into the resolver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn resolve_domains<I, F>(&self, hostnames: I, on_resolved: F) -> RoundId
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: FnOnce(ResolutionBatch) + Send + 'static,
    {
        let hostnames: BTreeSet<String> = hostnames.into_iter().map(Into::into).collect();

        let mut state = lock(&self.state);
        state.latest += 1;
        let round = state.latest;
        state.tasks.retain(|t| !t.is_finished());

        log::debug!(
            "Resolution round {} started for {} hostname(s) via {}",
            round,
            hostnames.len(),
            self.lookup.name()
        );

        let lookup = Arc::clone(&self.lookup);
        let timeout = self.timeout;
        let shared = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            let hosts = resolve_all(lookup, hostnames, timeout).await;
            let batch = ResolutionBatch { round, hosts };

            let state = lock(&shared);
            if !state.is_current(round) {
                log::debug!("Resolution round {} is stale, dropping results", round);
                return;
            }
            on_resolved(batch);
        });
        state.tasks.push(handle);

        round
    }

    /// Abandon every round in flight
    ///
    /// Once this returns, no callback from an earlier round will be invoked.
    pub fn cancel_all(&self) {
        let mut state = lock(&self.state);
        state.cancelled_through = state.latest;

        let pending: Vec<_> = state.tasks.drain(..).filter(|t| !t.is_finished()).collect();
        if !pending.is_empty() {
            log::debug!("Cancelling {} pending resolution round(s)", pending.len());
        }
        for task in pending {
            task.abort();
        }
    }

    /// The most recently started round (0 if none)
    pub fn current_round(&self) -> RoundId {
        lock(&self.state).latest
    }
}

impl Drop for HostnameResolver {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn lock(state: &Mutex<RoundState>) -> MutexGuard<'_, RoundState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn resolve_all(
    lookup: Arc<dyn HostLookup>,
    hostnames: BTreeSet<String>,
    timeout: Duration,
) -> HashMap<String, ResolvedHost> {
    let mut set = JoinSet::new();
    for hostname in hostnames {
        let lookup = Arc::clone(&lookup);
        set.spawn(async move {
            let result = tokio::time::timeout(timeout, lookup.lookup(&hostname)).await;
            match result {
                Ok(Ok(addresses)) => {
                    for ip in &addresses {
                        log::debug!("Resolved {}: {}", hostname, ip);
                    }
                    ResolvedHost::resolved(hostname, addresses)
                }
                Ok(Err(e)) => {
                    log::warn!("Failed to resolve {}: {}", hostname, e);
                    ResolvedHost::failed(hostname)
                }
                Err(_) => {
                    log::warn!("Failed to resolve {}: timed out after {:?}", hostname, timeout);
                    ResolvedHost::failed(hostname)
                }
            }
        });
    }

    let mut hosts = HashMap::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(host) => {
                hosts.insert(host.hostname.clone(), host);
            }
            Err(e) => log::error!("Hostname lookup task failed: {}", e),
        }
    }
    hosts
}

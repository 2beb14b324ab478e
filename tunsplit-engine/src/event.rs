//! Split tunnel events

use std::net::IpAddr;

use tunsplit_dns::RoundId;

use crate::policy::{Protocol, SplitTunnelMode};

/// Events emitted by the split tunnel controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitTunnelEvent {
    /// Redirect installed or changed
    Enabled {
        mode: SplitTunnelMode,
        target: IpAddr,
        /// Number of app identities redirected
        apps: usize,
    },

    /// Enforcement removed
    Disabled {
        reason: String,
    },

    /// Intended active, but no redirect target exists
    TargetUnavailable {
        mode: SplitTunnelMode,
        protocol: Protocol,
    },

    /// A new exception set was installed
    ExceptionsUpdated {
        count: usize,
    },

    /// Hostname resolution round started
    ResolutionStarted {
        round: RoundId,
        hostnames: usize,
    },

    /// Hostname resolution round delivered its results
    ResolutionCompleted {
        round: RoundId,
        resolved: usize,
        failed: usize,
    },

    /// A round finished after being superseded; its results were dropped
    StaleResolutionDiscarded {
        round: RoundId,
    },

    /// An adapter call failed; enforcement continues best-effort
    EnforcementFailed {
        operation: String,
        message: String,
    },
}

/// Event handler trait for receiving split tunnel events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a split tunnel event
    async fn on_event(&self, event: SplitTunnelEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: SplitTunnelEvent) {
        match event {
            SplitTunnelEvent::Enabled { mode, target, apps } => {
                log::info!("Split tunnel enabled: mode={}, target={}, apps={}", mode, target, apps);
            }
            SplitTunnelEvent::Disabled { reason } => {
                log::info!("Split tunnel disabled: {}", reason);
            }
            SplitTunnelEvent::TargetUnavailable { mode, protocol } => {
                log::error!(
                    "Split tunnel has no redirect target for mode={} protocol={}",
                    mode,
                    protocol
                );
            }
            SplitTunnelEvent::ExceptionsUpdated { count } => {
                log::info!("Split tunnel exceptions updated: {} entries", count);
            }
            SplitTunnelEvent::ResolutionStarted { round, hostnames } => {
                log::debug!("Resolution round {} started ({} hostnames)", round, hostnames);
            }
            SplitTunnelEvent::ResolutionCompleted {
                round,
                resolved,
                failed,
            } => {
                if failed > 0 {
                    log::warn!(
                        "Resolution round {} done: {} resolved, {} failed",
                        round,
                        resolved,
                        failed
                    );
                } else {
                    log::debug!("Resolution round {} done: {} resolved", round, resolved);
                }
            }
            SplitTunnelEvent::StaleResolutionDiscarded { round } => {
                log::debug!("Resolution round {} discarded as stale", round);
            }
            SplitTunnelEvent::EnforcementFailed { operation, message } => {
                log::error!("Split tunnel {} failed: {}", operation, message);
            }
        }
    }
}

/// Event handler that collects events in memory
#[derive(Default)]
pub struct CollectingEventHandler {
    events: std::sync::Mutex<Vec<SplitTunnelEvent>>,
}

impl CollectingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every event collected so far
    pub fn drain(&self) -> Vec<SplitTunnelEvent> {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *events)
    }
}

#[async_trait::async_trait]
impl EventHandler for CollectingEventHandler {
    async fn on_event(&self, event: SplitTunnelEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

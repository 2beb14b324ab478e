//! Controller behavior against the recording adapter
//!
//! Lookups are scripted and run on a paused clock, so resolution rounds
//! finish in a deterministic order.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tunsplit_dns::{HostLookup, HostnameResolver};
use tunsplit_enforce::mock::{AdapterCall, Operation, RecordingAdapter};
use tunsplit_enforce::{AppId, Route};
use tunsplit_engine::{
    AdapterInfo, CollectingEventHandler, Config, ConnectionStatus, EventHandler, PolicySettings,
    Protocol, SplitTunnelController, SplitTunnelEvent, SplitTunnelMode,
};

/// Lookup answering from a fixed table after a per-host delay
#[derive(Default)]
struct ScriptedLookup {
    answers: HashMap<String, (Duration, Option<Vec<IpAddr>>)>,
}

impl ScriptedLookup {
    fn answer(mut self, host: &str, delay_ms: u64, ips: &[&str]) -> Self {
        let ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        self.answers
            .insert(host.to_string(), (Duration::from_millis(delay_ms), Some(ips)));
        self
    }

    fn fail(mut self, host: &str, delay_ms: u64) -> Self {
        self.answers
            .insert(host.to_string(), (Duration::from_millis(delay_ms), None));
        self
    }
}

#[async_trait]
impl HostLookup for ScriptedLookup {
    async fn lookup(&self, hostname: &str) -> tunsplit_dns::Result<BTreeSet<IpAddr>> {
        let (delay, ips) = self
            .answers
            .get(hostname)
            .cloned()
            .ok_or_else(|| tunsplit_dns::Error::NoAddresses(hostname.to_string()))?;
        tokio::time::sleep(delay).await;
        ips.map(|v| v.into_iter().collect())
            .ok_or_else(|| tunsplit_dns::Error::Dns("SERVFAIL".into()))
    }

    fn name(&self) -> String {
        "scripted".into()
    }
}

struct Harness {
    adapter: Arc<RecordingAdapter>,
    events: Arc<CollectingEventHandler>,
    controller: SplitTunnelController,
    _install_dir: tempfile::TempDir,
}

impl Harness {
    /// Controller with an empty install directory
    fn new(lookup: ScriptedLookup) -> Self {
        let install_dir = tempfile::tempdir().unwrap();
        Self::with_install_dir(lookup, install_dir)
    }

    fn with_install_dir(lookup: ScriptedLookup, install_dir: tempfile::TempDir) -> Self {
        let adapter = Arc::new(RecordingAdapter::new());
        let events = Arc::new(CollectingEventHandler::new());
        let resolver = Arc::new(HostnameResolver::new(Arc::new(lookup)));
        let controller = SplitTunnelController::new(adapter.clone(), resolver)
            .with_event_handler(events.clone())
            .with_install_dir(install_dir.path());
        Self {
            adapter,
            events,
            controller,
            _install_dir: install_dir,
        }
    }

    async fn finish(self) {
        self.controller.shutdown().await;
        assert!(!self.controller.is_enforcing());
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn policy(
    active: bool,
    mode: SplitTunnelMode,
    apps: &[PathBuf],
    ips: &[&str],
    hostnames: &[&str],
) -> PolicySettings {
    PolicySettings::new(
        active,
        mode,
        apps.iter().cloned(),
        ips.iter().map(|s| net(s)),
        hostnames.iter().copied(),
    )
}

fn connected(protocol: Protocol) -> ConnectionStatus {
    ConnectionStatus::connected(
        protocol,
        AdapterInfo::new(Some(ip("10.8.0.2")), Some(ip("10.8.0.1"))),
        AdapterInfo::new(Some(ip("192.168.1.20")), Some(ip("192.168.1.1"))),
    )
}

fn write_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"#!/bin/sh\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

#[tokio::test]
async fn test_inactive_or_disconnected_installs_nothing() {
    let h = Harness::new(ScriptedLookup::default());
    let exclude = SplitTunnelMode::Exclude;

    h.controller
        .set_settings(policy(false, exclude, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::WireGuard))
        .await;
    h.controller
        .set_connection_status(ConnectionStatus::disconnected())
        .await;
    h.controller
        .set_settings(policy(true, exclude, &[], &["8.8.8.8"], &[]))
        .await;

    assert_eq!(h.adapter.call_count(), 0);
    assert_eq!(h.adapter.state(), Default::default());
    let status = h.controller.status().await;
    assert!(!status.enforcing);
    assert!(status.active);
    assert!(status.exceptions.is_empty());
    assert!(status.redirect_target.is_none());

    h.controller
        .set_connection_status(connected(Protocol::WireGuard))
        .await;
    assert!(h.controller.is_enforcing());
    assert_eq!(
        h.adapter.state().redirect.map(|(target, _)| target),
        Some(ip("192.168.1.1"))
    );

    h.controller
        .set_connection_status(ConnectionStatus::disconnected())
        .await;
    let state = h.adapter.state();
    assert!(!state.service_running);
    assert!(state.redirect.is_none());
    assert!(state.exceptions.is_empty());
    assert!(state.routes.is_empty());
    assert!(!h.controller.is_enforcing());
    assert!(h
        .events
        .drain()
        .contains(&SplitTunnelEvent::Disabled {
            reason: "tunnel disconnected".into()
        }));

    h.finish().await;
}

#[tokio::test]
async fn test_repeated_updates_make_no_adapter_calls() {
    let h = Harness::new(ScriptedLookup::default());
    let settings = policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8", "10.20.0.0/16"], &[]);
    let status = connected(Protocol::OpenVpn);

    h.controller.set_settings(settings.clone()).await;
    h.controller.set_connection_status(status).await;
    let calls = h.adapter.call_count();
    assert_eq!(h.adapter.count_of(Operation::StartService), 1);
    assert_eq!(h.adapter.count_of(Operation::AddRoute), 2);

    h.controller.set_connection_status(status).await;
    assert_eq!(h.adapter.call_count(), calls);

    // Same policy again recomputes, but nothing differs from what is installed
    h.controller.set_settings(settings).await;
    assert_eq!(h.adapter.call_count(), calls);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_superseded_round_never_becomes_visible() {
    let lookup = ScriptedLookup::default()
        .answer("a.com", 500, &["1.1.1.1"])
        .answer("b.com", 10, &["2.2.2.2"]);
    let h = Harness::new(lookup);
    let exclude = SplitTunnelMode::Exclude;

    h.controller
        .set_connection_status(connected(Protocol::WireGuard))
        .await;
    h.controller
        .set_settings(policy(true, exclude, &[], &[], &["a.com"]))
        .await;
    let first = h.controller.status().await.current_round.unwrap();
    h.controller
        .set_settings(policy(true, exclude, &[], &[], &["b.com"]))
        .await;
    let second = h.controller.status().await.current_round.unwrap();
    assert!(second > first);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = h.controller.status().await;
    assert_eq!(status.exceptions.iter().copied().collect::<Vec<_>>(), vec![net("2.2.2.2/32")]);
    for call in h.adapter.calls() {
        if let AdapterCall::SetExceptionAddresses(entries) = call {
            assert!(!entries.contains(&net("1.1.1.1/32")));
        }
    }
    assert!(!h
        .events
        .drain()
        .iter()
        .any(|e| matches!(e, SplitTunnelEvent::ResolutionCompleted { round, .. } if *round == first)));

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_blocked_sentinel_is_not_installed() {
    let lookup = ScriptedLookup::default().answer("x.example.com", 20, &["0.0.0.0", "1.2.3.4"]);
    let h = Harness::new(lookup);

    h.controller
        .set_settings(policy(
            true,
            SplitTunnelMode::Exclude,
            &[],
            &["0.0.0.0/32"],
            &["x.example.com"],
        ))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let state = h.adapter.state();
    assert_eq!(state.exceptions.iter().copied().collect::<Vec<_>>(), vec![net("1.2.3.4/32")]);
    assert_eq!(
        state.routes,
        [Route::host(ip("1.2.3.4"), ip("192.168.1.1"))].into_iter().collect()
    );

    h.finish().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_own_executables_only_in_exclude_mode() {
    let install_dir = tempfile::tempdir().unwrap();
    let helper = write_file(install_dir.path(), "vpn-helper");
    let apps_dir = tempfile::tempdir().unwrap();
    let browser = write_file(apps_dir.path(), "browser");
    let missing = apps_dir.path().join("not-installed");

    let h = Harness::with_install_dir(ScriptedLookup::default(), install_dir);
    let helper_id = AppId::from_path(&helper).unwrap();
    let browser_id = AppId::from_path(&browser).unwrap();
    let apps = [browser.clone(), missing];

    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &apps, &[], &[]))
        .await;

    let (_, redirected) = h.adapter.state().redirect.unwrap();
    assert_eq!(redirected.len(), 2);
    assert!(redirected.contains(&browser_id));
    assert!(redirected.contains(&helper_id));

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Include, &apps, &[], &[]))
        .await;
    let (target, redirected) = h.adapter.state().redirect.unwrap();
    assert_eq!(target, ip("10.8.0.1"));
    assert_eq!(redirected.iter().collect::<Vec<_>>(), vec![&browser_id]);

    // Detected once: new files in the install directory are not picked up
    write_file(helper.parent().unwrap(), "vpn-updater");
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &apps, &[], &[]))
        .await;
    let (_, redirected) = h.adapter.state().redirect.unwrap();
    assert_eq!(redirected.len(), 2);

    h.finish().await;
}

#[tokio::test]
async fn test_include_target_follows_protocol() {
    let h = Harness::new(ScriptedLookup::default());

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Include, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;
    assert_eq!(h.controller.status().await.redirect_target, Some(ip("10.8.0.1")));
    assert!(h
        .adapter
        .state()
        .routes
        .contains(&Route::host(ip("8.8.8.8"), ip("10.8.0.1"))));

    h.controller
        .set_connection_status(connected(Protocol::WireGuard))
        .await;
    assert_eq!(h.controller.status().await.redirect_target, Some(ip("10.8.0.2")));
    assert_eq!(
        h.adapter.state().routes,
        [
            Route::host(ip("8.8.8.8"), ip("10.8.0.2")),
            Route::new(net("0.0.0.0/1"), ip("192.168.1.1")),
            Route::new(net("128.0.0.0/1"), ip("192.168.1.1")),
        ]
        .into_iter()
        .collect()
    );

    h.controller
        .set_connection_status(connected(Protocol::Stunnel))
        .await;
    assert_eq!(h.controller.status().await.redirect_target, Some(ip("10.8.0.1")));

    h.controller
        .set_connection_status(connected(Protocol::Ikev2))
        .await;
    assert_eq!(h.controller.status().await.redirect_target, Some(ip("10.8.0.2")));

    h.finish().await;
}

#[tokio::test]
async fn test_missing_target_records_error_and_installs_nothing() {
    let h = Harness::new(ScriptedLookup::default());

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Include, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::None))
        .await;

    let status = h.controller.status().await;
    assert!(status.active);
    assert!(!status.enforcing);
    assert!(status.last_error.is_some());
    assert_eq!(h.adapter.call_count(), 0);
    assert!(h.events.drain().contains(&SplitTunnelEvent::TargetUnavailable {
        mode: SplitTunnelMode::Include,
        protocol: Protocol::None,
    }));

    // WireGuard without a known adapter address is just as unusable
    h.controller
        .set_connection_status(ConnectionStatus::connected(
            Protocol::WireGuard,
            AdapterInfo::new(None, None),
            AdapterInfo::new(None, Some(ip("192.168.1.1"))),
        ))
        .await;
    assert!(h.controller.status().await.last_error.is_some());
    assert_eq!(h.adapter.call_count(), 0);

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_exclude() {
    let lookup = ScriptedLookup::default().answer("x.example.com", 50, &["1.1.1.1"]);
    let h = Harness::new(lookup);
    let gateway = ip("192.168.1.1");

    h.controller
        .set_settings(policy(
            true,
            SplitTunnelMode::Exclude,
            &[],
            &["8.8.8.8"],
            &["x.example.com"],
        ))
        .await;
    h.controller
        .set_connection_status(ConnectionStatus::connected(
            Protocol::WireGuard,
            AdapterInfo::new(Some(ip("10.8.0.2")), None),
            AdapterInfo::new(Some(ip("192.168.1.20")), Some(gateway)),
        ))
        .await;

    // Literals are installed right away
    let status = h.controller.status().await;
    assert_eq!(status.exceptions.len(), 1);
    assert_eq!(status.current_round, Some(1));

    tokio::time::sleep(Duration::from_secs(1)).await;

    let status = h.controller.status().await;
    assert!(status.enforcing);
    assert_eq!(status.redirect_target, Some(gateway));
    assert_eq!(
        status.exceptions.iter().copied().collect::<BTreeSet<_>>(),
        [net("8.8.8.8/32"), net("1.1.1.1/32")].into_iter().collect()
    );
    assert_eq!(status.routes, 2);
    assert!(status.last_error.is_none());
    assert_eq!(
        h.adapter.state().routes,
        [Route::host(ip("8.8.8.8"), gateway), Route::host(ip("1.1.1.1"), gateway)]
            .into_iter()
            .collect()
    );

    let events = h.events.drain();
    assert!(events.contains(&SplitTunnelEvent::ResolutionStarted {
        round: 1,
        hostnames: 1
    }));
    assert!(events.contains(&SplitTunnelEvent::ResolutionCompleted {
        round: 1,
        resolved: 1,
        failed: 0
    }));
    assert!(events.contains(&SplitTunnelEvent::ExceptionsUpdated { count: 2 }));

    let adapter = h.adapter.clone();
    h.finish().await;
    let state = adapter.state();
    assert!(state.exceptions.is_empty() && state.routes.is_empty() && state.redirect.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_lookup_keeps_other_exceptions() {
    let lookup = ScriptedLookup::default()
        .answer("up.example.com", 10, &["203.0.113.5"])
        .fail("down.example.com", 10);
    let h = Harness::new(lookup);

    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;
    h.controller
        .set_settings(policy(
            true,
            SplitTunnelMode::Exclude,
            &[],
            &[],
            &["up.example.com", "down.example.com"],
        ))
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let status = h.controller.status().await;
    assert_eq!(status.exceptions.iter().copied().collect::<Vec<_>>(), vec![net("203.0.113.5/32")]);
    assert!(h.events.drain().iter().any(|e| matches!(
        e,
        SplitTunnelEvent::ResolutionCompleted { resolved: 1, failed: 1, .. }
    )));

    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_hostname_drops_its_addresses() {
    let lookup = ScriptedLookup::default().answer("x.example.com", 10, &["1.1.1.1"]);
    let h = Harness::new(lookup);
    let gateway = ip("192.168.1.1");

    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;
    h.controller
        .set_settings(policy(
            true,
            SplitTunnelMode::Exclude,
            &[],
            &["8.8.8.8"],
            &["x.example.com"],
        ))
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.adapter.state().exceptions.len(), 2);

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    let state = h.adapter.state();
    assert_eq!(state.exceptions.iter().copied().collect::<Vec<_>>(), vec![net("8.8.8.8/32")]);
    assert!(h
        .adapter
        .calls()
        .contains(&AdapterCall::RemoveRoute(Route::host(ip("1.1.1.1"), gateway))));
    assert_eq!(h.controller.status().await.current_round, None);

    h.finish().await;
}

#[tokio::test]
async fn test_enforcement_failure_is_reported_not_fatal() {
    let h = Harness::new(ScriptedLookup::default());
    h.adapter.fail_on(Operation::EnableRedirect);

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;

    let status = h.controller.status().await;
    assert!(status.enforcing);
    assert!(status.redirect_target.is_none());
    assert!(status.last_error.as_deref().unwrap().starts_with("enable_redirect"));
    // The rest of the state was still pushed
    assert_eq!(status.exceptions.len(), 1);
    assert!(h.events.drain().iter().any(|e| matches!(
        e,
        SplitTunnelEvent::EnforcementFailed { operation, .. } if operation == "enable_redirect"
    )));

    // The next recomputation retries what is missing
    h.adapter.clear_failures();
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    let status = h.controller.status().await;
    assert_eq!(status.redirect_target, Some(ip("192.168.1.1")));
    assert!(status.last_error.is_none());

    h.finish().await;
}

#[tokio::test]
async fn test_shutdown_is_final() {
    let h = Harness::new(ScriptedLookup::default());
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;
    assert!(h.controller.is_enforcing());

    h.controller.shutdown().await;
    assert!(!h.controller.is_enforcing());
    assert_eq!(h.adapter.state(), Default::default());

    let calls = h.adapter.call_count();
    h.controller
        .set_connection_status(connected(Protocol::WireGuard))
        .await;
    assert!(!h.controller.is_enforcing());
    assert_eq!(h.adapter.call_count(), calls);

    // Shutting down twice is harmless
    h.finish().await;
}

#[tokio::test]
#[should_panic(expected = "dropped while enforcing")]
async fn test_drop_while_enforcing_panics() {
    let h = Harness::new(ScriptedLookup::default());
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;

    drop(h);
}

#[tokio::test]
async fn test_controller_from_config() {
    let install_dir = tempfile::tempdir().unwrap();
    let toml = format!(
        r#"
[split_tunnel]
active = true
mode = "include"
ips = ["192.0.2.0/24"]

[enforcement]
backend = "dry-run"
install_dir = '{}'

[connection]
protocol = "wireguard"
vpn_ip = "10.8.0.2"
"#,
        install_dir.path().display()
    );
    let config = Config::from_toml(&toml).unwrap();
    let adapter = Arc::new(RecordingAdapter::new());

    let controller = SplitTunnelController::from_config(&config, adapter.clone()).unwrap();
    controller.set_settings(config.policy().unwrap()).await;
    controller
        .set_connection_status(config.connection_status())
        .await;

    assert_eq!(controller.policy().await.mode, SplitTunnelMode::Include);
    assert_eq!(controller.connection_status().await.protocol, Protocol::WireGuard);
    let state = adapter.state();
    assert_eq!(state.redirect.map(|(target, _)| target), Some(ip("10.8.0.2")));
    assert!(state.exceptions.contains(&net("192.0.2.0/24")));

    controller.shutdown().await;
}

fn shadow_routes(gateway: &str) -> BTreeSet<Route> {
    [
        Route::new(net("0.0.0.0/1"), ip(gateway)),
        Route::new(net("128.0.0.0/1"), ip(gateway)),
    ]
    .into_iter()
    .collect()
}

#[tokio::test]
async fn test_include_mode_shadows_tunnel_default_route() {
    let h = Harness::new(ScriptedLookup::default());
    let shadows = shadow_routes("192.168.1.1");

    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    let routes = h.adapter.state().routes;
    assert!(routes.is_disjoint(&shadows));
    assert_eq!(routes.len(), 1);

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Include, &[], &["8.8.8.8"], &[]))
        .await;
    let routes = h.adapter.state().routes;
    assert!(routes.is_superset(&shadows));
    assert!(routes.contains(&Route::host(ip("8.8.8.8"), ip("10.8.0.1"))));
    assert_eq!(h.controller.status().await.routes, 3);

    // Back to exclude drops the shadowing
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    assert!(h.adapter.state().routes.is_disjoint(&shadows));
    for route in &shadows {
        assert!(h.adapter.calls().contains(&AdapterCall::RemoveRoute(route.clone())));
    }

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Include, &[], &[], &[]))
        .await;
    assert_eq!(h.adapter.state().routes, shadows);

    h.controller
        .set_connection_status(ConnectionStatus::disconnected())
        .await;
    assert!(h.adapter.state().routes.is_empty());

    h.finish().await;
}

#[tokio::test]
async fn test_include_without_default_gateway_skips_shadowing() {
    let h = Harness::new(ScriptedLookup::default());

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Include, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(ConnectionStatus::connected(
            Protocol::WireGuard,
            AdapterInfo::new(Some(ip("10.8.0.2")), None),
            AdapterInfo::default(),
        ))
        .await;

    assert!(h.controller.is_enforcing());
    assert_eq!(
        h.adapter.state().routes,
        [Route::host(ip("8.8.8.8"), ip("10.8.0.2"))].into_iter().collect()
    );

    h.finish().await;
}

#[tokio::test]
async fn test_repeated_status_retries_failed_step() {
    let h = Harness::new(ScriptedLookup::default());
    let status = connected(Protocol::OpenVpn);
    h.adapter.fail_on(Operation::EnableRedirect);

    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller.set_connection_status(status).await;
    assert!(h.controller.is_enforcing());
    assert!(h.adapter.state().redirect.is_none());
    assert!(h.controller.status().await.last_error.is_some());

    h.adapter.clear_failures();
    h.controller.set_connection_status(status).await;
    let status_now = h.controller.status().await;
    assert_eq!(status_now.redirect_target, Some(ip("192.168.1.1")));
    assert!(status_now.last_error.is_none());
    assert_eq!(h.adapter.count_of(Operation::StartService), 1);
    assert_eq!(h.adapter.count_of(Operation::AddRoute), 1);

    // Now in sync, so the same status is a no-op again
    let calls = h.adapter.call_count();
    h.controller.set_connection_status(status).await;
    assert_eq!(h.adapter.call_count(), calls);

    h.finish().await;
}

/// Records events, stalling on every exception update while the controller
/// lock is held
struct StallingEvents {
    inner: CollectingEventHandler,
    stall: Duration,
}

#[async_trait]
impl EventHandler for StallingEvents {
    async fn on_event(&self, event: SplitTunnelEvent) {
        if matches!(event, SplitTunnelEvent::ExceptionsUpdated { .. }) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.on_event(event).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_delivered_after_new_round_is_discarded() {
    let lookup = ScriptedLookup::default()
        .answer("a.com", 50, &["1.1.1.1"])
        .answer("b.com", 1_000, &["2.2.2.2"]);
    let adapter = Arc::new(RecordingAdapter::new());
    let events = Arc::new(StallingEvents {
        inner: CollectingEventHandler::new(),
        stall: Duration::from_millis(200),
    });
    let install_dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(HostnameResolver::new(Arc::new(lookup)));
    let controller = SplitTunnelController::new(adapter.clone(), resolver)
        .with_event_handler(events.clone())
        .with_install_dir(install_dir.path());
    let exclude = SplitTunnelMode::Exclude;

    controller
        .set_connection_status(connected(Protocol::WireGuard))
        .await;
    controller
        .set_settings(policy(true, exclude, &[], &[], &["a.com"]))
        .await;
    let first = controller.status().await.current_round.unwrap();

    // The new literal stalls this update past a.com's answer, so round one
    // hands its batch over before the next round starts
    tokio::time::sleep(Duration::from_millis(10)).await;
    controller
        .set_settings(policy(true, exclude, &[], &["8.8.8.8"], &["b.com"]))
        .await;
    let second = controller.status().await.current_round.unwrap();
    assert!(second > first);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let drained = events.inner.drain();
    assert!(drained.contains(&SplitTunnelEvent::StaleResolutionDiscarded { round: first }));
    assert!(!drained
        .iter()
        .any(|e| matches!(e, SplitTunnelEvent::ResolutionCompleted { .. })));
    assert_eq!(
        adapter.state().exceptions.iter().copied().collect::<Vec<_>>(),
        vec![net("8.8.8.8/32")]
    );
    for call in adapter.calls() {
        if let AdapterCall::SetExceptionAddresses(entries) = call {
            assert!(!entries.contains(&net("1.1.1.1/32")));
        }
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        adapter.state().exceptions.iter().copied().collect::<BTreeSet<_>>(),
        [net("8.8.8.8/32"), net("2.2.2.2/32")].into_iter().collect()
    );

    controller.shutdown().await;
}

#[tokio::test]
async fn test_failed_teardown_keeps_enforcing_until_retried() {
    let h = Harness::new(ScriptedLookup::default());
    h.controller
        .set_settings(policy(true, SplitTunnelMode::Exclude, &[], &["8.8.8.8"], &[]))
        .await;
    h.controller
        .set_connection_status(connected(Protocol::OpenVpn))
        .await;

    h.adapter.fail_on(Operation::StopService);
    h.controller.shutdown().await;
    assert!(h.controller.is_enforcing());
    let state = h.adapter.state();
    assert!(state.service_running);
    assert!(state.redirect.is_none() && state.routes.is_empty());
    assert!(h
        .controller
        .status()
        .await
        .last_error
        .unwrap()
        .starts_with("stop_service"));

    h.adapter.clear_failures();
    h.finish().await;
}

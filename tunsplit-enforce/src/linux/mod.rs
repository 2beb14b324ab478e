//! Linux enforcement backend
//!
//! - Exception routes go into the main routing table through [`RouteManager`].
//!   Routes whose gateway is a local address (the VPN adapter IP) are added
//!   on-link through the owning interface with `ip route`.
//! - The exception set lives in two nftables sets of a dedicated `inet` table,
//!   accepted by an output chain ahead of any kill-switch rules.
//! - The per-app redirect puts matching processes into a net_cls cgroup,
//!   marks their packets with nftables, and sends marked packets through a
//!   policy routing table whose default route points at the redirect target.
//!
//! Processes started after [`enable_redirect`](EnforcementAdapter::enable_redirect)
//! inherit the cgroup only if their parent is already in it; others are picked
//! up the next time the redirect is enabled.
//!
//! Requires root or `CAP_NET_ADMIN`, the `nft` and `ip` tools, and a mounted
//! net_cls v1 hierarchy.

mod cgroup;
mod cmd;
mod nft;

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::adapter::EnforcementAdapter;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::route::{Route, RouteManager};
use crate::types::{AppIdentitySet, ExceptionSet};

#[derive(Default)]
struct RedirectState {
    target: Option<IpAddr>,
    rule_installed: bool,
}

/// Enforcement adapter programming routes, nftables, and policy routing
pub struct LinuxAdapter {
    config: BackendConfig,
    routes: RouteManager,
    cgroup: cgroup::NetClsCgroup,
    redirect: Mutex<RedirectState>,
}

impl LinuxAdapter {
    pub fn new(config: BackendConfig) -> Result<Self> {
        if !nft::valid_table_name(&config.table) {
            return Err(Error::Config(format!(
                "invalid nftables table name '{}'",
                config.table
            )));
        }
        if config.fwmark == 0 || config.routing_table == 0 {
            return Err(Error::Config(
                "fwmark and routing table must be non-zero".into(),
            ));
        }

        let routes = RouteManager::new()?;
        let cgroup = cgroup::NetClsCgroup::new(&config.cgroup_root, &config.table, config.classid);

        Ok(Self {
            config,
            routes,
            cgroup,
            redirect: Mutex::new(RedirectState::default()),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn nft(&self, script: &str) -> Result<()> {
        log::trace!("nft script:\n{}", script);
        cmd::run("nft", &["-f", "-"], Some(script))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                Error::Command { command, stderr } => {
                    Error::Firewall(format!("{}: {}", command, stderr))
                }
                other => other,
            })
    }

    fn family_flag(target: IpAddr) -> &'static str {
        if target.is_ipv4() {
            "-4"
        } else {
            "-6"
        }
    }

    /// Interface that owns `addr`, if it is one of this host's addresses
    async fn local_owner(&self, addr: IpAddr) -> Result<Option<String>> {
        let addr_str = addr.to_string();
        let out = cmd::run(
            "ip",
            &[Self::family_flag(addr), "-o", "addr", "show", "to", &addr_str],
            None,
        )
        .await?;
        Ok(cmd::parse_owning_interface(&out))
    }

    /// Point the policy routing table's default route at `target`
    ///
    /// A gateway is used as next hop; a local address (VPN adapter IP) means
    /// "leave through the interface that owns it, with it as source".
    async fn install_default_route(&self, target: IpAddr) -> Result<()> {
        let table = self.config.routing_table.to_string();
        let target_str = target.to_string();
        let family = Self::family_flag(target);

        let result = match self.local_owner(target).await? {
            Some(dev) => {
                log::debug!("Redirect target {} is local to {}", target, dev);
                cmd::run(
                    "ip",
                    &[
                        family, "route", "replace", "default", "dev", &dev, "src", &target_str,
                        "table", &table,
                    ],
                    None,
                )
                .await
            }
            None => {
                cmd::run(
                    "ip",
                    &[family, "route", "replace", "default", "via", &target_str, "table", &table],
                    None,
                )
                .await
            }
        };
        result.map(|_| ()).map_err(|e| Error::Redirect(e.to_string()))
    }

    fn with_default_metric(&self, route: &Route) -> Route {
        match (route.metric, self.config.route_metric) {
            (None, Some(m)) => route.clone().with_metric(m),
            _ => route.clone(),
        }
    }

    /// Interface owning the route's gateway when the gateway is a local address
    ///
    /// The kernel rejects a local address as next hop, so such routes are
    /// programmed on-link through `ip` instead of `net-route`.
    async fn on_link_device(&self, route: &Route) -> Result<Option<String>> {
        match route.gateway {
            Some(gw) => self.local_owner(gw).await,
            None => Ok(None),
        }
    }

    async fn install_rule(&self, family: &str) -> Result<()> {
        let mark = format!("{:#x}", self.config.fwmark);
        let table = self.config.routing_table.to_string();
        // Delete first so repeated enables never stack duplicate rules
        cmd::run_quiet("ip", &[family, "rule", "del", "fwmark", &mark, "lookup", &table]).await;
        cmd::run("ip", &[family, "rule", "add", "fwmark", &mark, "lookup", &table], None)
            .await
            .map(|_| ())
            .map_err(|e| Error::Redirect(e.to_string()))
    }

    async fn remove_rules(&self) {
        let mark = format!("{:#x}", self.config.fwmark);
        let table = self.config.routing_table.to_string();
        for family in ["-4", "-6"] {
            cmd::run_quiet("ip", &[family, "rule", "del", "fwmark", &mark, "lookup", &table]).await;
            cmd::run_quiet("ip", &[family, "route", "flush", "table", &table]).await;
        }
    }
}

#[async_trait]
impl EnforcementAdapter for LinuxAdapter {
    fn name(&self) -> &str {
        "linux"
    }

    async fn start_service(&self) -> Result<()> {
        cmd::run("nft", &["--version"], None).await?;
        self.nft(&format!("add table inet {}\n", self.config.table)).await?;
        log::info!("Linux split tunnel backend ready (table inet {})", self.config.table);
        Ok(())
    }

    async fn stop_service(&self) -> Result<()> {
        self.remove_rules().await;
        let released = self.cgroup.release_all().unwrap_or(0);
        if released > 0 {
            log::debug!("Released {} process(es) from redirect cgroup", released);
        }
        self.cgroup.remove();
        self.nft(&nft::teardown_script(&self.config.table)).await?;
        *self.redirect.lock().await = RedirectState::default();
        log::info!("Linux split tunnel backend stopped");
        Ok(())
    }

    async fn enable_redirect(&self, target: IpAddr, apps: &AppIdentitySet) -> Result<()> {
        let mut state = self.redirect.lock().await;

        self.cgroup.create()?;
        let pids = cgroup::matching_pids(std::path::Path::new("/proc"), apps);
        for pid in &pids {
            if let Err(e) = self.cgroup.assign(*pid) {
                log::debug!("Could not move pid {} into redirect cgroup: {}", pid, e);
            }
        }

        self.nft(&nft::redirect_script(
            &self.config.table,
            self.config.classid,
            self.config.fwmark,
        ))
        .await?;

        if state.target != Some(target) || !state.rule_installed {
            self.remove_rules().await;
            self.install_default_route(target).await?;
            self.install_rule(Self::family_flag(target)).await?;
            state.target = Some(target);
            state.rule_installed = true;
        }

        log::info!(
            "Redirect enabled via {} for {} app(s), {} running process(es)",
            target,
            apps.len(),
            pids.len()
        );
        Ok(())
    }

    async fn disable_redirect(&self) -> Result<()> {
        let mut state = self.redirect.lock().await;

        self.remove_rules().await;
        self.cgroup.release_all()?;
        self.nft(&nft::clear_redirect_script(&self.config.table)).await?;

        *state = RedirectState::default();
        log::info!("Redirect disabled");
        Ok(())
    }

    async fn set_exception_addresses(&self, set: &ExceptionSet) -> Result<()> {
        self.nft(&nft::exceptions_script(&self.config.table, set)).await?;
        log::info!("Firewall exception set updated ({} entries)", set.len());
        Ok(())
    }

    async fn add_route(&self, route: &Route) -> Result<()> {
        let route = self.with_default_metric(route);
        match self.on_link_device(&route).await? {
            Some(dev) => {
                let args = on_link_route_args("replace", &route, &dev);
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                cmd::run("ip", &args, None)
                    .await
                    .map_err(|e| Error::Route(e.to_string()))?;
                log::info!("Added route: {} dev {}", route.destination, dev);
                Ok(())
            }
            None => self.routes.add(&route).await,
        }
    }

    async fn remove_route(&self, route: &Route) -> Result<()> {
        let route = self.with_default_metric(route);
        match self.on_link_device(&route).await? {
            Some(dev) => {
                let args = on_link_route_args("del", &route, &dev);
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                match cmd::run("ip", &args, None).await {
                    Ok(_) => {
                        log::info!("Deleted route: {} dev {}", route.destination, dev);
                        Ok(())
                    }
                    Err(Error::Command { stderr, .. }) if stderr.contains("No such process") => {
                        log::debug!("Route already absent: {} dev {}", route.destination, dev);
                        Ok(())
                    }
                    Err(e) => Err(Error::Route(e.to_string())),
                }
            }
            None => self.routes.delete(&route).await,
        }
    }
}

/// `ip route` arguments for an on-link route leaving through `dev`
///
/// The local gateway becomes the preferred source address.
fn on_link_route_args(verb: &str, route: &Route, dev: &str) -> Vec<String> {
    let family = if route.is_ipv4() { "-4" } else { "-6" };
    let mut args = vec![
        family.to_string(),
        "route".to_string(),
        verb.to_string(),
        route.destination.to_string(),
        "dev".to_string(),
        dev.to_string(),
    ];
    if verb != "del" {
        if let Some(gw) = route.gateway {
            args.extend(["src".to_string(), gw.to_string()]);
        }
    }
    if let Some(metric) = route.metric {
        args.extend(["metric".to_string(), metric.to_string()]);
    }
    args
}

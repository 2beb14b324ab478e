//! tunsplit CLI
//!
//! Applies a split tunnel policy from a configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunsplit_enforce::mock::RecordingAdapter;
use tunsplit_enforce::{
    default_shadow_routes, exception_routes, system_adapter, AppIdentitySet, EnforcementAdapter,
};
use tunsplit_engine::{routing_plan, Backend, Config, SplitTunnelController};

/// tunsplit - split tunneling for VPN clients
#[derive(Parser)]
#[command(name = "tunsplit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tunsplit.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); defaults to the config file's
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the configured policy until interrupted
    Run,

    /// Show what would be enforced without touching the system
    Plan,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tunsplit.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| Config::load(&cli.config).ok().map(|c| c.common.log_level))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Run => run(&cli.config).await,
        Commands::Plan => plan(&cli.config),
        Commands::GenConfig { output } => generate_config(output),
    }
}

/// Install the tracing subscriber; `log` records from the libraries are
/// bridged into it by `init()`
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config_path: &Path) -> Result<()> {
    info!("Starting tunsplit...");

    let config = load_config(config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let recorder = match config.enforcement.backend {
        Backend::DryRun => Some(Arc::new(RecordingAdapter::new())),
        Backend::System => None,
    };
    let adapter: Arc<dyn EnforcementAdapter> = match recorder {
        Some(ref recorder) => recorder.clone(),
        None => system_adapter(&config.backend_config())
            .context("Failed to create enforcement backend")?,
    };
    info!("Using {} enforcement backend", adapter.name());

    let controller = SplitTunnelController::from_config(&config, adapter)
        .context("Failed to create split tunnel controller")?;

    let policy = config.policy().context("Invalid split tunnel policy")?;
    let connection = config.connection_status();
    if !connection.is_connected {
        warn!("No [connection] in configuration, nothing will be enforced");
    }

    controller.set_settings(policy).await;
    controller.set_connection_status(connection).await;

    let status = controller.status().await;
    info!(
        "Split tunnel {}: mode={}, target={:?}, {} exception(s)",
        if status.enforcing { "enforcing" } else { "idle" },
        status.mode,
        status.redirect_target,
        status.exceptions.len()
    );
    if let Some(ref e) = status.last_error {
        warn!("Enforcement incomplete: {}", e);
    }

    let waited = wait_for_shutdown().await;

    info!("Shutting down...");
    controller.shutdown().await;

    if let Some(recorder) = recorder {
        println!("Adapter calls ({}):", recorder.call_count());
        for call in recorder.calls() {
            println!("  {:?}", call);
        }
    }

    waited
}

fn plan(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let policy = config.policy().context("Invalid split tunnel policy")?;
    let connection = config.connection_status();
    let plan = routing_plan(policy.mode, connection.protocol);

    println!("Active:    {}", policy.active);
    println!("Mode:      {}", policy.mode);
    println!("Protocol:  {}", connection.protocol);
    println!("Connected: {}", connection.is_connected);
    println!("Target:    {}", plan.target);
    println!("Own apps:  {:?}", plan.self_exclusion);

    let apps = AppIdentitySet::set_from_list(&policy.apps);
    println!("Apps ({} of {} found):", apps.len(), policy.apps.len());
    for app in &apps {
        println!("  {}", app);
    }

    let literals = tunsplit_engine::build_exception_set(&policy.ips, std::iter::empty());
    println!("Exceptions: {}", literals);
    if !policy.hostnames.is_empty() {
        let names: Vec<&str> = policy.hostnames.iter().map(String::as_str).collect();
        println!("Hostnames (resolved at run time): {}", names.join(", "));
    }

    match plan.target.resolve(&connection) {
        Some(target) => {
            println!("Redirect target: {}", target);
            for route in exception_routes(&literals, target, config.enforcement.route_metric) {
                println!("  route {}", route);
            }
        }
        None => println!("Redirect target: unavailable"),
    }

    if plan.shadow_default_route {
        match connection.default_adapter.gateway_ip {
            Some(gateway) => {
                println!("Tunnel default route shadowed via {}:", gateway);
                for route in default_shadow_routes(gateway, config.enforcement.route_metric) {
                    println!("  route {}", route);
                }
            }
            None => println!("Tunnel default route: not shadowed (default gateway unknown)"),
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the apps, ips and hostnames lists before running.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

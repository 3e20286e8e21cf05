//! nimbus Node Agent
//!
//! Starts instances on this node from controller start commands and prints
//! one JSON report per command on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nimbus_node_agent::config::{BackendKind, Config};
use nimbus_node_agent::firecracker::{FirecrackerBackend, FirecrackerConfig};
use nimbus_node_agent::network::{
    ControllerConnection, MockConnection, NetworkEvent, TapNetwork, TapNetworkConfig,
};
use nimbus_node_agent::{
    Backend, Launcher, LauncherConfig, MockVirtualizer, StartCommand, StartDispatcher,
};

/// nimbus node agent.
#[derive(Debug, Parser)]
#[command(name = "node-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the instances described by start command files.
    Start {
        /// JSON files, each holding one start command.
        #[arg(required = true)]
        commands: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    info!(
        node_id = %config.node_id,
        node_ip = %config.node_ip,
        instances_dir = %config.instances_dir.display(),
        networking = config.networking_enabled,
        backend = %config.backend,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Start { commands } => start(&config, &commands).await,
    }
}

async fn start(config: &Config, paths: &[PathBuf]) -> Result<()> {
    let mut commands = Vec::with_capacity(paths.len());
    for path in paths {
        commands.push(load_command(path).await?);
    }

    tokio::fs::create_dir_all(&config.instances_dir)
        .await
        .with_context(|| format!("failed to create {}", config.instances_dir.display()))?;

    let launcher = Arc::new(Launcher::new(LauncherConfig::from(config)));
    let (dispatcher, mut reports) = StartDispatcher::new(
        launcher,
        backend(config),
        connection(config),
        config.instances_dir.clone(),
        config.max_concurrent_starts,
    );

    let total = commands.len();
    for cmd in commands {
        dispatcher.submit(cmd);
    }
    // Tasks hold their own handles; the channel closes once the last one reports.
    drop(dispatcher);

    let mut failed = 0;
    while let Some(report) = reports.recv().await {
        if report.is_failure() {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }

    if failed > 0 {
        bail!("{failed} of {total} starts failed");
    }
    info!(count = total, "All instances started");
    Ok(())
}

async fn load_command(path: &Path) -> Result<StartCommand> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("invalid start command in {}", path.display()))
}

fn backend(config: &Config) -> Arc<dyn Backend> {
    match config.backend {
        BackendKind::Firecracker => Arc::new(FirecrackerBackend::new(FirecrackerConfig {
            firecracker_path: config.firecracker_path.clone(),
            kernel_path: config.kernel_path.clone(),
            images_dir: config.images_dir.clone(),
        })),
        BackendKind::Mock => Arc::new(MockVirtualizer::new()),
    }
}

fn connection(config: &Config) -> Arc<dyn ControllerConnection> {
    if !config.networking_enabled {
        // Never called when networking is off.
        return Arc::new(MockConnection::new());
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                NetworkEvent::TenantAdded {
                    tenant_id,
                    subnet,
                    subnet_key,
                    bridge,
                    concentrator_ip,
                } => info!(
                    tenant_id = %tenant_id,
                    subnet = %subnet,
                    subnet_key,
                    bridge = %bridge,
                    concentrator_ip = %concentrator_ip,
                    "Tenant added"
                ),
                NetworkEvent::TenantRemoved {
                    tenant_id,
                    subnet_key,
                    bridge,
                } => info!(tenant_id = %tenant_id, subnet_key, bridge = %bridge, "Tenant removed"),
            }
        }
        debug!("Network event channel closed");
    });

    Arc::new(TapNetwork::new(TapNetworkConfig::default(), events_tx))
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use don_capabilities::streams::DEFAULT_TRIGGER_ID;
use don_capabilities::topology::HashedRegistry;
use don_capabilities::{
    Capability, Config, ConnectionManager, Dispatcher, Launcher, LocalRegistry, LoopbackNetwork,
    MercuryTriggerService, PeerId, Registry, Service, TopologySnapshot, TriggerCapability, launcher,
};

/// doncap - capability registry and cross-DON capability launcher
#[derive(Parser)]
#[command(name = "doncap", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ~/.config/don-capabilities/config.toml)
    #[arg(long, env = "DONCAP_CONFIG")]
    config: Option<PathBuf>,

    /// Local peer id, overriding the config file
    #[arg(long)]
    peer: Option<PeerId>,

    /// Topology file uses hashed capability ids
    #[arg(long)]
    hashed: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print how the local node classifies every DON in a topology
    Plan {
        /// Topology snapshot (JSON)
        topology: PathBuf,
    },
    /// Launch a single-node loopback deployment until interrupted
    Run {
        /// Topology snapshot (JSON)
        topology: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,don_capabilities=info",
        1 => "info,don_capabilities=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.peer.is_some() {
        config.peer_id = cli.peer;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Plan { topology } => {
            let snapshot = load_snapshot(&topology, cli.hashed)?;
            cmd_plan(&config, snapshot.as_ref())
        }
        Command::Run { topology } => {
            let snapshot = load_snapshot(&topology, cli.hashed)?;
            cmd_run(&config, snapshot.as_ref()).await
        }
    }
}

fn load_snapshot(path: &Path, hashed: bool) -> anyhow::Result<Box<dyn TopologySnapshot>> {
    let snapshot: Box<dyn TopologySnapshot> = if hashed {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let registry: HashedRegistry = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Box::new(registry)
    } else {
        Box::new(
            LocalRegistry::from_json_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
        )
    };
    Ok(snapshot)
}

fn cmd_plan(config: &Config, snapshot: &dyn TopologySnapshot) -> anyhow::Result<()> {
    let peer_id = config.require_peer_id()?;
    let plan = launcher::plan(snapshot, peer_id);
    if let Err(e) = plan.workflow_don() {
        tracing::warn!(error = %e, "topology would be rejected at launch");
    }
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn cmd_run(config: &Config, snapshot: &dyn TopologySnapshot) -> anyhow::Result<()> {
    let peer_id = config.require_peer_id()?;

    let network = LoopbackNetwork::new();
    let dispatcher = network.join(peer_id);
    let registry = Arc::new(Registry::new());

    let trigger_service = Arc::new(MercuryTriggerService::new(
        DEFAULT_TRIGGER_ID,
        config.streams.tick_resolution_ms,
        config.streams.queue_capacity,
    )?);
    trigger_service.start().await?;
    registry
        .add(Capability::Trigger(
            Arc::clone(&trigger_service) as Arc<dyn TriggerCapability>
        ))
        .await?;

    let launcher = Launcher::new(
        peer_id,
        Arc::clone(&registry),
        Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
        Arc::clone(&dispatcher) as Arc<dyn ConnectionManager>,
        config.launcher_config(),
    );

    if let Err(e) = launcher.launch(snapshot).await {
        launcher.close().await.ok();
        trigger_service.close().await.ok();
        return Err(e).context("failed to launch capabilities");
    }

    tracing::info!(
        peer_id = %peer_id,
        capabilities = registry.len().await,
        shims = launcher.service_count().await,
        "node ready, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    launcher.close().await?;
    trigger_service.close().await?;
    Ok(())
}

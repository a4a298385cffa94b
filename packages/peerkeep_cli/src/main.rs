// Runner for a single peerkeep node

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use peerkeep::network::tcp::TcpTransport;
use peerkeep::scheduler::TaskScheduler;
use peerkeep::{Node, NodeConfig, NodeDeps};

#[derive(Parser)]
#[command(name = "peerkeep")]
#[command(about = "Peer-to-peer encrypted backup node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and run until interrupted
    Run {
        /// Config file path
        #[arg(short, long, default_value = "peerkeep.json")]
        config: PathBuf,

        /// Enter catalog recovery after connecting to peers
        #[arg(long)]
        recover: bool,
    },

    /// Write a default configuration with a fresh node ID
    InitConfig {
        /// Where to write the configuration
        path: PathBuf,

        /// Data directory for the new node
        #[arg(short, long, default_value = "peerkeep-data")]
        data_dir: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match cli.command {
        Commands::Run { config, recover } => run(config, recover).await,
        Commands::InitConfig {
            path,
            data_dir,
            force,
        } => init_config(path, data_dir, force),
    }
}

fn init_config(path: PathBuf, data_dir: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = NodeConfig::with_data_dir(data_dir);
    config
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {} for node {}", path.display(), config.node_id);
    Ok(())
}

async fn run(config_path: PathBuf, recover: bool) -> Result<()> {
    let config = NodeConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let listen = config.listen_address.clone();
    let peers = config.peers.clone();

    let deps = NodeDeps::from_config(&config)?;
    let registry = deps.registry.clone();
    let node = Node::open(config, deps)?;

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let transport = TcpTransport::new(node.id(), registry, inbox_tx);
    if let Some(address) = listen {
        transport.listen(&address).await?;
    }
    for peer in &peers {
        if let Err(e) = transport.connect(peer.peer_id, &peer.address).await {
            log::warn!("Could not reach peer {} at {}: {}", peer.peer_id, peer.address, e);
        }
    }

    let dispatch = node.spawn_dispatch_loop(inbox_rx);

    if recover {
        let asked = node.start_recovery().await?;
        log::info!("Recovery requested from {} peers", asked);
    }

    let scheduler = TaskScheduler::new();
    node.start_background(&scheduler);
    log::info!("Node {} running; press Ctrl-C to stop", node.id());

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down after current tasks finish");
    scheduler.shutdown().await;
    dispatch.abort();
    node.flush().await?;
    Ok(())
}

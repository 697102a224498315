//! Stake-Sync-Node CLI
//!
//! Runs a node that keeps its peer pools healthy and its chain in sync.

use clap::{Parser, Subcommand};
use stake_sync_node::config::NodeConfig;
use stake_sync_node::network::Node;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stake-sync-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer registry and chain synchronization node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Seed peers (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Address other peers reach this node at
        #[arg(long)]
        my_address: Option<String>,
    },

    /// Print the default configuration as JSON
    DefaultConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&NodeConfig::default())?);
        }

        Commands::Start {
            config,
            port,
            peers,
            my_address,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(port) = port {
                node_config.port = port;
            }
            if let Some(address) = my_address {
                node_config.my_address = address;
            }
            if let Some(peers) = peers {
                node_config.seed_peers.extend(
                    peers
                        .split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty()),
                );
            }

            let node = Node::new(node_config)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(node.start())?;
        }
    }

    Ok(())
}

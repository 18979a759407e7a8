//! Blockchain Service CLI Application
//!
//! Runs the peer-connection service and probes NAT traversal.

use blockchain_service::config::NodeConfig;
use blockchain_service::nat::{self, PortMapping};
use blockchain_service::network::{Node, Reactors};
use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "blockchain-service")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-connection service for a blockchain node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// P2P Node operations
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },

    /// NAT traversal diagnostics
    Nat {
        #[command(subcommand)]
        action: NatCommands,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Start the P2P node
    Start {
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on (host:port)
        #[arg(short, long)]
        listen: Option<String>,

        /// NAT mechanism: none, any, upnp, pmp[:gateway], extip:<ip>
        #[arg(long)]
        nat: Option<String>,

        /// Concurrent handshakes
        #[arg(long)]
        max_handshakes: Option<usize>,

        /// Initial peers to connect to (comma-separated)
        #[arg(long)]
        peers: Option<String>,
    },
}

#[derive(Subcommand)]
enum NatCommands {
    /// Resolve a mechanism and print the external address
    Probe {
        /// NAT mechanism to try
        #[arg(long, default_value = "any")]
        nat: String,

        /// Also map this TCP port, then remove the mapping
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match cli.command {
            Commands::Node { action } => run_node_command(action).await,
            Commands::Nat { action } => run_nat_command(action).await,
        }
    })
}

async fn run_node_command(action: NodeCommands) -> Result<(), Box<dyn Error>> {
    match action {
        NodeCommands::Start {
            config,
            listen,
            nat,
            max_handshakes,
            peers,
        } => {
            let mut config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(nat) = nat {
                config.nat = nat;
            }
            if let Some(max_handshakes) = max_handshakes {
                config.max_handshakes = max_handshakes;
            }
            if let Some(peers) = peers {
                config.bootstrap_peers.extend(
                    peers
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                );
            }

            println!("🌐 Starting P2P node on {}...", config.listen_addr);
            let node = Node::start(config, Reactors::new()).await?;
            println!("   Node ID: {}", node.node_id());
            println!("   Listening on {}", node.local_addr());

            tokio::signal::ctrl_c().await?;
            println!("\n📴 Shutting down node...");
            node.shutdown().await;
        }
    }

    Ok(())
}

async fn run_nat_command(action: NatCommands) -> Result<(), Box<dyn Error>> {
    match action {
        NatCommands::Probe { nat, port } => {
            let Some(nat) = nat::parse(&nat)? else {
                println!("NAT traversal is disabled");
                return Ok(());
            };

            println!("🔍 Probing {}...", nat);
            let external = nat.external_address().await?;
            println!("   Mechanism: {}", nat);
            println!("   External address: {}", external);

            if let Some(port) = port {
                let mapping = PortMapping::tcp(port, "blockchain-service probe");
                let mapped = nat.add_port_mapping(&mapping).await?;
                println!("   Mapped {}:{} -> local port {}", external, mapped, port);

                if let Err(e) = nat
                    .delete_port_mapping(mapping.protocol, mapped, mapping.internal_port)
                    .await
                {
                    println!("   ⚠️  Failed to remove mapping: {}", e);
                }
            }
        }
    }

    Ok(())
}

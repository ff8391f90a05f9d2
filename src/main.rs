//! Shibui - Cluster Formation Node
//!
//! Starts a node's bus listener and, in cluster mode, forms the cluster
//! described by the peers file and balances the hash space across it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shibui::cluster::{self, peers, ClusterState, FormationCoordinator, LocalIdentity, Membership, PeerNode};
use shibui::config::ShibuiConfig;
use shibui::error::Result;
use shibui::network::{BusServer, Joiner, TcpDialer};

/// Shibui - cluster formation and range balancing
#[derive(Parser)]
#[command(name = "shibui")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind the listeners to
    #[arg(short = 'a', long, global = true)]
    address: Option<String>,

    /// Client port (the bus port is this + 100)
    #[arg(short = 'p', long, global = true)]
    port: Option<u16>,

    /// Node name
    #[arg(short = 'i', long, global = true)]
    id: Option<String>,

    /// Enable cluster mode
    #[arg(short = 'c', long, global = true)]
    cluster: bool,

    /// Cluster peers file
    #[arg(short = 'f', long, global = true)]
    file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node (default)
    Start,

    /// Check the configuration and peers file, print the partition preview
    Validate,

    /// Write a starter configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shibui.toml")]
        output: PathBuf,

        /// Node name
        #[arg(long, default_value = "A")]
        node_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Init { output, node_id }) = &cli.command {
        return run_init(output, node_id);
    }

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            return Err(e);
        }
    };

    init_logging(&config.logging.level);

    match cli.command {
        None | Some(Commands::Start) => run_start(config).await,
        Some(Commands::Validate) => run_validate(config),
        Some(Commands::Init { .. }) => Ok(()),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the TOML file (if any) and apply CLI overrides
fn load_config(cli: &Cli) -> Result<ShibuiConfig> {
    let mut config = match &cli.config {
        Some(path) => ShibuiConfig::from_file(path)?,
        None => ShibuiConfig::default(),
    };

    if let Some(address) = &cli.address {
        config.node.bind_address = address.clone();
    }
    if let Some(port) = cli.port {
        config.node.client_port = port;
    }
    if let Some(id) = &cli.id {
        config.node.id = id.clone();
    }
    if cli.cluster {
        config.cluster.enabled = true;
    }
    if let Some(file) = &cli.file {
        config.cluster.peers_file = file.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Start the node
async fn run_start(config: ShibuiConfig) -> Result<()> {
    tracing::info!("Starting shibui node {}...", config.node.id);

    let local = LocalIdentity::new(
        config.node.id.clone(),
        config.node.bind_address.clone(),
        config.node.client_port,
    );
    let state = Arc::new(if config.cluster.enabled {
        ClusterState::new(local)
    } else {
        ClusterState::single_node(local)
    });

    let bus = match BusServer::bind(&config.bus_address(), Arc::clone(&state), config.handshake_timeout()).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            tracing::error!("Failed to start bus listener: {}", e);
            return Err(e);
        }
    };

    // Inbound joins wait in the listen backlog until the membership holds
    // the peers file order
    if config.cluster.enabled {
        let listed = match peers::load_peers_file(&config.cluster.peers_file) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to load peers file: {}", e);
                return Err(e);
            }
        };
        peers::populate(&state, listed).await;
        tracing::info!("Cluster initialized with {} nodes", state.size().await);
    }

    let bus_runner = Arc::clone(&bus);
    let bus_handle = tokio::spawn(async move {
        if let Err(e) = bus_runner.run().await {
            tracing::error!("Bus server error: {}", e);
        }
    });

    if !config.cluster.enabled {
        tracing::info!("Running in single node mode");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received shutdown signal");
        bus.stop();
        let _ = bus_handle.await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let joiner = Joiner::new(
        Arc::new(TcpDialer::new(config.connect_timeout())),
        state.local().clone(),
        config.handshake_timeout(),
    );
    let formation = FormationCoordinator::new(
        Arc::clone(&state),
        joiner,
        config.formation_config(),
        shutdown_rx,
    )
    .spawn();

    tokio::select! {
        result = formation.wait() => {
            match result {
                Ok(report) => {
                    tracing::info!(
                        "Cluster formed and balanced in {} probe passes ({} nodes)",
                        report.passes,
                        report.partition.entries().len()
                    );
                }
                Err(e) => {
                    tracing::error!("Cluster formation failed: {}", e);
                    bus.stop();
                    return Err(e);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal during formation");
            let _ = shutdown_tx.send(true);
            bus.stop();
            let _ = bus_handle.await;
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    bus.stop();
    let _ = bus_handle.await;

    tracing::info!("Shibui shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: &Path, node_id: &str) -> Result<()> {
    let config_content = format!(r#"# Shibui Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "127.0.0.1"
client_port = 6373

[cluster]
enabled = true
peers_file = "./conf/cluster.conf"
# Must be identical on every node
hash_span = 16384
grace_period_ms = 2000
probe_interval_ms = 3000
max_probe_interval_ms = 30000
# max_probe_passes = 100
connect_timeout_ms = 1000
handshake_timeout_ms = 2000

[logging]
level = "info"
"#);

    std::fs::write(output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nList every node as `<address> <port> <name>` in the peers file.");
    println!("Then start with: shibui --config {}", output.display());

    Ok(())
}

/// Validate configuration and preview the partition table
fn run_validate(config: ShibuiConfig) -> Result<()> {
    println!("✓ Configuration is valid");
    println!("  Node:         {}", config.node.id);
    println!("  Client:       {}:{}", config.node.bind_address, config.node.client_port);
    println!("  Bus:          {}", config.bus_address());
    println!("  Cluster mode: {}", config.cluster.enabled);
    println!("  Hash span:    {}", config.cluster.hash_span);

    if !config.cluster.enabled {
        return Ok(());
    }

    let peers = peers::load_peers_file(&config.cluster.peers_file)?;
    let mut membership = Membership::new(PeerNode::local(
        config.node.id.clone(),
        config.node.bind_address.clone(),
        config.node.client_port,
    ));
    for peer in peers {
        if let Err(e) = membership.add_node(peer) {
            println!("  ! {}", e);
        }
    }

    let table = cluster::balance(&mut membership, config.cluster.hash_span)?;
    println!();
    println!("Partition preview (fingerprint {:08x}):", table.fingerprint());
    for entry in table.entries() {
        println!(
            "  {:<12} {:>15}:{:<5} {}",
            entry.name, entry.address, entry.client_port, entry.range
        );
    }

    Ok(())
}

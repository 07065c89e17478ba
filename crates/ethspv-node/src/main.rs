//! ethspv Node -- LES light client.
//!
//! Usage:
//!   ethspv-node                          # Run with default config
//!   ethspv-node --config path.toml       # Run with custom config
//!   ethspv-node run --watch-account 0x.. # Run and prove an account periodically
//!   ethspv-node identity                 # Show node identity
//!   ethspv-node parse-enode enode://..   # Check a bootnode URL

use ethspv_node::config::{self, NodeConfig};
use ethspv_node::discovery_task::{self, Discovery};
use ethspv_node::peer_pool::PeerPool;
use ethspv_node::swarm_task::{self, Swarm};
use ethspv_node::sync_task::{self, SyncCommand, SyncCoordinator};
use ethspv_node::{expand_tilde, NodeEvent};

use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ethspv_crypto::NodeKey;
use ethspv_peer::{LocalHello, NodeTable};
use ethspv_protocol::discovery::{Endpoint, Node};
use ethspv_storage::{ChainStorage, JsonFileStorage, Storage};
use ethspv_sync::{EngineConfig, HeaderSyncer};
use parking_lot::Mutex;
use rand::rngs::OsRng;

/// How often the dialer tops up outbound sessions.
const DIAL_INTERVAL: Duration = Duration::from_secs(5);
/// How often a watched account is re-proven.
const WATCH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "ethspv-node", about = "Ethereum LES light client")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.ethspv/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run {
        /// Account address (hex) to fetch and prove against the synced head
        #[arg(long)]
        watch_account: Option<String>,
    },
    /// Show the node identity, generating a key if none exists
    Identity,
    /// Parse an enode URL and print its parts
    ParseEnode { url: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ethspv_node=info,ethspv_sync=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Identity) => {
            let key_path = expand_tilde(&cfg.node.key_file);
            let key = NodeKey::load_or_create(&key_path, &mut OsRng)?;
            println!("Node ID: {}", key.node_id().to_hex());
            println!("Key file: {}", key_path.display());
            let endpoint = Endpoint::new(
                local_ip(&cfg.network.listen_host)?,
                cfg.network.udp_port,
                cfg.network.tcp_port,
            );
            println!("Enode: {}", Node::new(key.node_id(), endpoint).to_enode());
        }
        Some(Commands::ParseEnode { url }) => {
            let node = Node::from_enode(&url)?;
            println!("Node ID: {}", node.id.to_hex());
            println!("TCP: {}", node.endpoint.tcp_addr());
            println!("UDP: {}", node.endpoint.udp_addr());
        }
        Some(Commands::Run { watch_account }) => {
            let watch = watch_account.as_deref().map(parse_address).transpose()?;
            run_node(cfg, watch).await?;
        }
        None => run_node(cfg, None).await?,
    }

    Ok(())
}

fn local_ip(host: &str) -> anyhow::Result<[u8; 4]> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|e| anyhow::anyhow!("network.listen_host {host}: {e}"))?;
    Ok(ip.octets())
}

fn parse_address(text: &str) -> anyhow::Result<[u8; 20]> {
    let bytes = hex::decode(text.trim_start_matches("0x"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("address must be 20 bytes, got {}", b.len()))
}

async fn run_node(cfg: config::NodeConfig, watch: Option<[u8; 20]>) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.node.key_file);
    let key = Arc::new(NodeKey::load_or_create(&key_path, &mut OsRng)?);
    let local_id = key.node_id();
    let genesis = cfg.network.genesis()?;
    let bootnodes = cfg.network.bootnodes()?;
    let checkpoint = cfg.sync.checkpoint()?;

    tracing::info!(
        node_id = %local_id,
        version = env!("CARGO_PKG_VERSION"),
        network_id = cfg.network.network_id,
        "starting ethspv-node"
    );
    tracing::info!(
        host = %cfg.network.listen_host,
        tcp = cfg.network.tcp_port,
        udp = cfg.network.udp_port,
        bootnodes = bootnodes.len(),
        max_peers = cfg.network.max_peers,
        "network config"
    );

    // Open storage
    let data_dir = expand_tilde(&cfg.node.data_dir);
    let store_path = data_dir.join("chain.json");
    let storage: Arc<dyn Storage> = Arc::new(JsonFileStorage::open(&store_path)?);
    match storage.last_header()? {
        Some(head) => tracing::info!(head = head.number, hash = %head.hash_hex(), "storage opened"),
        None => tracing::info!(
            checkpoint = checkpoint.number,
            path = %store_path.display(),
            "storage empty, syncing from checkpoint"
        ),
    }

    // Shared node table, seeded with bootnodes
    let table = Arc::new(Mutex::new(NodeTable::new(local_id)));
    let seeded = table.lock().add(bootnodes.iter().copied());
    tracing::info!(seeded, "node table seeded");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<NodeEvent>(1024);
    let (command_tx, command_rx) = tokio::sync::mpsc::channel::<SyncCommand>(64);

    let pool = PeerPool::new();
    let hello = LocalHello::light_client(local_id, cfg.node.client_id.clone(), cfg.network.tcp_port);
    let swarm = Swarm::new(
        key.clone(),
        hello,
        pool.clone(),
        table.clone(),
        event_tx,
        shutdown_tx.clone(),
        cfg.network.max_peers,
    );

    // Spawn TCP listener
    let listen_addr = format!("{}:{}", cfg.network.listen_host, cfg.network.tcp_port);
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    let listener_handle = {
        let swarm = swarm.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            swarm_task::run_listener(swarm, listener, shutdown).await;
        })
    };

    // Spawn dialer
    let dialer_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            swarm_task::run_dialer(swarm, DIAL_INTERVAL, shutdown).await;
        })
    };

    // Spawn discovery
    let discovery_handle = if cfg.discovery.enabled {
        let udp_addr = format!("{}:{}", cfg.network.listen_host, cfg.network.udp_port);
        let socket = Arc::new(tokio::net::UdpSocket::bind(&udp_addr).await?);
        tracing::info!(addr = %udp_addr, "discovery listening");
        let local = Endpoint::new(
            local_ip(&cfg.network.listen_host)?,
            cfg.network.udp_port,
            cfg.network.tcp_port,
        );
        let discovery = Arc::new(
            Discovery::new(key.clone(), socket, local, table.clone()).with_limits(
                cfg.discovery.alpha,
                Duration::from_secs(cfg.discovery.session_timeout_secs),
            ),
        );
        let interval = Duration::from_secs(cfg.discovery.lookup_interval_secs);
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            discovery_task::run_discovery_loop(discovery, interval, shutdown).await;
        }))
    } else {
        tracing::info!("discovery disabled, using bootnodes only");
        None
    };

    // Spawn sync coordinator
    let sync_handle = {
        let mut engine_config = EngineConfig::new(cfg.network.network_id, genesis);
        engine_config.request_timeout = cfg.sync.request_timeout();
        engine_config.max_attempts = cfg.sync.max_attempts;
        let syncer = HeaderSyncer::new(storage.clone(), checkpoint, cfg.sync.headers_limit);
        let coordinator = SyncCoordinator::new(engine_config, syncer, storage.clone(), pool.clone());
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            sync_task::run_sync_loop(coordinator, event_rx, command_rx, shutdown).await;
        })
    };

    // Periodic account proof
    let watch_handle = watch.map(|address| {
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if command_tx.send(SyncCommand::AccountState { address }).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    });

    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    let _ = shutdown_tx.send(());

    // Wait for all tasks
    let _ = tokio::join!(listener_handle, dialer_handle, sync_handle);
    if let Some(handle) = discovery_handle {
        let _ = handle.await;
    }
    if let Some(handle) = watch_handle {
        let _ = handle.await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

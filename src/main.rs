//! WolfSync - Replication Engine for a Distributed Blob Store
//!
//! Runs one storage node's replication engine: pulls blobs from peer
//! replicas, serves its own journal to peers and reports status over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::api::HttpServer;
use wolfsync::cluster::{ClusterMap, StaticClusterMap};
use wolfsync::config::{LoggingConfig, WolfSyncConfig};
use wolfsync::error::Result;
use wolfsync::network::{ReplicaServer, TcpReplicaClient};
use wolfsync::replication::{
    CheckpointStore, ManagerSettings, ReplicationManager, ReplicationMetrics,
};
use wolfsync::store::MemoryStore;
use wolfsync::tuning::{auto_tune, tuning_summary};

/// WolfSync - Replication Engine for a Distributed Blob Store
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replication engine
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Print the checkpointed peer tokens
    Tokens,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config may not exist yet (init), so logging falls back to defaults
    let logging = WolfSyncConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(logging.level.as_str()), &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Tokens => run_tokens(cli.config).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the replication engine
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfSync node...");

    let config = match WolfSyncConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let tuned = auto_tune();
    let settings = ManagerSettings::from_config(&config, &tuned);

    let map = StaticClusterMap::from_config(&config)?;
    let local = map.local_replicas();
    if local.is_empty() {
        tracing::warn!(
            "No replicas in the cluster map are placed on {}; nothing to replicate",
            map.local_node()
        );
    }

    let store = Arc::new(MemoryStore::with_partitions(
        local.iter().map(|r| r.partition()),
    ));
    let metrics = Arc::new(ReplicationMetrics::new(config.node.id.clone()));

    let checkpoint_store = match CheckpointStore::open(&config.checkpoint_dir()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to open checkpoint store in {:?}: {}", config.checkpoint_dir(), e);
            return Err(e);
        }
    };

    let client = Arc::new(TcpReplicaClient::new(
        config.node.id.clone(),
        settings.intra_colo.connect_timeout,
        settings
            .intra_colo
            .request_timeout
            .max(settings.inter_colo.request_timeout),
    ));

    // Serve our own journal to peers
    let server = Arc::new(ReplicaServer::new(
        config.node.bind_address.clone(),
        Arc::clone(&store) as _,
        Arc::clone(&metrics),
    ));
    let listener = server.bind().await?;
    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("Replica server error: {}", e);
            }
        })
    };

    let manager = ReplicationManager::new(
        settings,
        Arc::clone(&client) as _,
        Arc::clone(&store) as _,
        checkpoint_store,
        Arc::clone(&metrics),
    );
    if let Err(e) = manager.start(&map).await {
        tracing::error!("Failed to start replication: {}", e);
        server.stop();
        return Err(e);
    }

    let http_handle = if config.api.enabled {
        let http = HttpServer::new(
            config.api.clone(),
            config.node.id.clone(),
            Arc::clone(manager.registry()),
            Arc::clone(manager.metrics()),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = http.start().await {
                tracing::error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    tracing::info!(
        peers = manager.registry().len(),
        "WolfSync node {} running",
        config.node.id
    );

    wait_for_shutdown(&config_path, &manager, &store).await?;

    tracing::info!("Shutting down...");
    let result = manager.shutdown().await;
    client.network().close_all().await;
    server.stop();
    let _ = server_handle.await;
    if let Some(handle) = http_handle {
        handle.abort();
    }

    tracing::info!("WolfSync shutdown complete");
    result
}

/// Wait for Ctrl+C, re-reading the cluster map on every SIGHUP
#[cfg(unix)]
async fn wait_for_shutdown(
    config_path: &Path,
    manager: &ReplicationManager,
    store: &MemoryStore,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                return Ok(());
            }
            _ = hangup.recv() => {
                tracing::info!("Received SIGHUP, reloading cluster map");
                if let Err(e) = reload_cluster_map(config_path, manager, store).await {
                    tracing::error!("Cluster map reload failed, keeping current assignment: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _config_path: &Path,
    _manager: &ReplicationManager,
    _store: &MemoryStore,
) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    Ok(())
}

#[cfg_attr(not(unix), allow(dead_code))]
async fn reload_cluster_map(
    config_path: &Path,
    manager: &ReplicationManager,
    store: &MemoryStore,
) -> Result<()> {
    let config = WolfSyncConfig::from_file(config_path)?;
    let map = StaticClusterMap::from_config(&config)?;
    for replica in map.local_replicas() {
        store.add_partition(replica.partition()).await;
    }
    manager.apply_cluster_map(&map).await?;
    tracing::info!(peers = manager.registry().len(), "Cluster map reloaded");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    std::fs::write(&output, WolfSyncConfig::sample(&node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to describe your cluster's replicas.");
    println!("Then start with: wolfsync start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    let config = match WolfSyncConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            return Err(e);
        }
    };

    let map = match StaticClusterMap::from_config(&config) {
        Ok(map) => map,
        Err(e) => {
            eprintln!("✗ Cluster map error: {}", e);
            return Err(e);
        }
    };

    println!("✓ Configuration is valid");
    println!("  Node ID: {}", config.node.id);
    println!("  Bind Address: {}", config.node.bind_address);
    println!("  Datacenter: {}", config.node.datacenter);
    println!("  Replicas in map: {}", map.replicas().len());
    println!("  Local replicas: {}", map.local_replicas().len());
    Ok(())
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfSyncConfig::from_file(&config_path)?;
    let map = StaticClusterMap::from_config(&config)?;
    let tuned = auto_tune();
    let settings = ManagerSettings::from_config(&config, &tuned);

    println!("WolfSync Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Datacenter:       {}", config.node.datacenter);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("{}", tuning_summary(&tuned));
    println!();
    for (name, pool) in [("Intra-colo", &settings.intra_colo), ("Inter-colo", &settings.inter_colo)] {
        println!("{} pool:", name);
        println!("  Threads:        {}", pool.threads);
        println!("  Request:        {:?}", pool.request_timeout);
        println!("  Batch:          {} entries / {} bytes", pool.limits.max_entries, pool.limits.max_bytes);
        println!("  Backoff:        {:?} .. {:?}", pool.backoff_base, pool.backoff_max);
    }
    println!();
    println!("Local replicas:");
    for local in map.local_replicas() {
        println!("  {}", local);
        for peer in map.peer_replicas(&local) {
            println!("    <- {}", peer);
        }
    }

    Ok(())
}

/// Print the checkpointed peer tokens
async fn run_tokens(config_path: PathBuf) -> Result<()> {
    let config = WolfSyncConfig::from_file(&config_path)?;
    let store = CheckpointStore::open(&config.checkpoint_dir())?;

    let mut records: Vec<_> = store.restore().await?.into_values().collect();
    records.sort_by(|a, b| a.key.cmp(&b.key));

    println!("Checkpoint: {}", store.path().display());
    if records.is_empty() {
        println!("  (no tokens recorded)");
    }
    for record in records {
        println!(
            "  {}  token {}  store {}  written {}",
            record.key,
            record.token,
            record.store_id,
            record.written_at.to_rfc3339()
        );
    }

    Ok(())
}

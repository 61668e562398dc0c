use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use harmonylite::broker::memory::MemoryBroker;
use harmonylite::broker::Broker;
use harmonylite::config::Config;
use harmonylite::db::cdc;
use harmonylite::db::pool::Pool;
use harmonylite::node::Node;
use harmonylite::snapshot::store::{BrokerSnapshotStore, FsSnapshotStore, SnapshotStore};
use harmonylite::snapshot::SnapshotManager;

/// Replication sidecar for SQLite: captures row changes with triggers,
/// fans them out over sharded durable streams, and applies peers' changes
/// with last-arrival-wins semantics.
#[derive(Parser)]
#[command(name = "harmonylite", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the configured node id.
    #[arg(long)]
    node_id: Option<u64>,

    /// Cluster listener address for an external broker deployment.
    #[arg(long)]
    cluster_addr: Option<String>,

    /// Comma-separated peer URLs for an external broker deployment.
    #[arg(long)]
    cluster_peers: Option<String>,

    /// Comma-separated leaf-node URLs for an external broker deployment.
    #[arg(long)]
    leaf_servers: Option<String>,

    /// Drop every HarmonyLite table and trigger, then exit.
    #[arg(long)]
    cleanup: bool,

    /// Produce one snapshot, then exit.
    #[arg(long)]
    save_snapshot: bool,

    /// Profiling listener address.
    #[arg(long)]
    pprof: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    anyhow::ensure!(!config.db_path.is_empty(), "db_path is required");

    init_logging(&config.logging.level);
    for (flag, value) in [
        ("--cluster-addr", &cli.cluster_addr),
        ("--cluster-peers", &cli.cluster_peers),
        ("--leaf-servers", &cli.leaf_servers),
        ("--pprof", &cli.pprof),
    ] {
        if value.is_some() {
            warn!("{flag} configures an external collaborator; this build runs the in-process broker and ignores it");
        }
    }

    if cli.cleanup {
        let db_path = config.db_path();
        tokio::task::spawn_blocking(move || -> harmonylite::Result<()> {
            let conn = rusqlite::Connection::open(db_path)?;
            cdc::remove_artifacts(&conn)?;
            Ok(())
        })
        .await??;
        info!("removed all HarmonyLite tables and triggers");
        return Ok(());
    }

    let broker = MemoryBroker::new();
    let store = build_store(&config, &*broker).await?;

    if cli.save_snapshot {
        let store = store.context("snapshot store is not configured")?;
        let pool = Pool::new(config.db_path(), config.connection_pool_size);
        let manager = SnapshotManager::new(config.db_path(), store);
        manager.save(&pool).await?;
        info!("snapshot saved");
        return Ok(());
    }

    let mut node = Node::start(config, broker, store).await?;
    info!("harmonylite running");

    let outcome = tokio::select! {
        res = node.wait() => Some(res),
        res = shutdown_signal() => {
            res?;
            None
        }
    };
    match outcome {
        Some(res) => {
            let _ = node.stop().await;
            res.context("node terminated")?;
        }
        None => {
            info!("signal received; shutting down");
            node.stop().await?;
        }
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_store(
    config: &Config,
    broker: &dyn Broker,
) -> anyhow::Result<Option<Arc<dyn SnapshotStore>>> {
    if !config.snapshot.enabled {
        return Ok(None);
    }
    match config.snapshot.store.as_str() {
        "fs" => {
            anyhow::ensure!(
                !config.snapshot.fs.path.is_empty(),
                "snapshot.fs.path is required when snapshot.store = \"fs\""
            );
            let store = FsSnapshotStore::new(&config.snapshot.fs.path)?;
            Ok(Some(Arc::new(store)))
        }
        "broker" => Ok(Some(Arc::new(BrokerSnapshotStore::open(broker).await?))),
        other => anyhow::bail!("snapshot store {other:?} is not bundled in this build"),
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

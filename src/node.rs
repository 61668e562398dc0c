//! Assembles the replication sidecar for one database.
//!
//! Startup order matters: streams are validated first, then a pending
//! snapshot restore runs while no pool exists, then CDC is (re)installed,
//! and only then do the scanner and the shard subscriptions start.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::apply::ApplyEngine;
use crate::broker::Broker;
use crate::config::Config;
use crate::db::cache::SchemaCache;
use crate::db::cdc;
use crate::db::pool::Pool;
use crate::db::scanner::{ChangeScanner, ScannerOptions};
use crate::db::schema;
use crate::error::{Error, Result};
use crate::health::{Health, HealthReport};
use crate::registry::SchemaRegistry;
use crate::replicator::{ReplicationOptions, Replicator};
use crate::seqmap::SequenceMap;
use crate::snapshot::leader::SnapshotLeader;
use crate::snapshot::store::SnapshotStore;
use crate::snapshot::SnapshotManager;

pub struct Node {
    pool: Pool,
    cache: Arc<SchemaCache>,
    seq_map: Arc<SequenceMap>,
    registry: Arc<SchemaRegistry>,
    snapshot: Option<Arc<SnapshotManager>>,
    leader: Option<Arc<SnapshotLeader>>,
    health: Arc<Health>,
    shutdown: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

impl Node {
    /// Bring up a node against `broker`, restoring from `store` first when
    /// the log has truncated past the local checkpoint.
    pub async fn start(
        config: Config,
        broker: Arc<dyn Broker>,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self> {
        let opts = ReplicationOptions {
            node_id: config.node_id,
            shards: config.replication_log.shards,
            max_entries: config.replication_log.max_entries,
            replicas: config.replication_log.replicas,
            compress: config.replication_log.compress,
            update_existing: config.replication_log.update_existing,
            publish: config.publish,
            replicate: config.replicate,
            ..ReplicationOptions::default()
        };

        let seq_map = Arc::new(SequenceMap::open(config.seq_map_path())?);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let replicator = Replicator::connect(
            Arc::clone(&broker),
            opts,
            Arc::clone(&seq_map),
            snapshot_tx,
        )
        .await?;
        let streams = replicator.stream_names();

        let snapshot = store.map(|s| SnapshotManager::new(config.db_path(), s));
        if let Some(manager) = &snapshot {
            manager
                .restore_if_needed(&*broker, &streams, &seq_map)
                .await?;
        }

        let health = Arc::new(Health::default());
        let pool = Pool::new(config.db_path(), config.connection_pool_size);
        let watched = {
            let pool = pool.clone();
            let configured = config.tables.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
                let conn = pool.borrow()?;
                let names = if configured.is_empty() {
                    schema::list_user_tables(&conn)?
                } else {
                    configured
                };
                let described = schema::inspect_tables(&conn, &names)?;
                cdc::install(&conn, &described)?;
                Ok(names)
            })
            .await??
        };
        health.set_db_ok(true);
        health.set_cdc_installed(watched.len());
        info!(node_id = config.node_id, tables = watched.len(), "change capture installed");

        let cache = {
            let pool = pool.clone();
            let watched = watched.clone();
            tokio::task::spawn_blocking(move || SchemaCache::initialize(pool, watched))
                .await??
        };
        let registry = SchemaRegistry::open(&*broker, config.node_id).await?;
        registry
            .publish(&cache.current(), &cache.previous())
            .await?;

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Registry entries carry a TTL; keep ours alive while we run.
        {
            let registry = Arc::clone(&registry);
            let cache = Arc::clone(&cache);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let mut tick = tokio::time::interval(crate::registry::ENTRY_TTL / 3);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tick.tick() => {}
                    }
                    if let Err(e) = registry
                        .publish(&cache.current(), &cache.previous())
                        .await
                    {
                        warn!(error = %e, "failed to refresh schema-registry entry");
                    }
                }
            });
        }

        let apply = ApplyEngine::new(
            pool.clone(),
            Arc::clone(&cache),
            Arc::clone(&broker),
            streams,
            Arc::clone(&seq_map),
            Some(Arc::clone(&registry)),
            Arc::clone(&health),
            config.schema_nak_delay(),
            config.schema_recompute_interval(),
        );

        if config.publish {
            let scanner = Arc::new(ChangeScanner::new(
                pool.clone(),
                Arc::clone(&cache),
                config.node_id,
                ScannerOptions {
                    max_changes: config.scan_max_changes,
                    cleanup_interval: config.cleanup_interval(),
                    polling_interval: config.polling_interval(),
                    wake_timeout: config.sleep_timeout(),
                },
                Arc::clone(&health),
            ));
            tasks.spawn(scanner.run(Arc::clone(&replicator), shutdown.clone()));
        }

        if config.replicate {
            tasks.spawn(Arc::clone(&replicator).run(apply, shutdown.clone()));
        }

        let mut leader = None;
        if config.snapshot.enabled {
            match &snapshot {
                Some(manager) => {
                    let elected =
                        SnapshotLeader::open(&*broker, config.node_id, config.leader_ttl())
                            .await?;
                    {
                        let elected = Arc::clone(&elected);
                        let shutdown = shutdown.clone();
                        tasks.spawn(async move {
                            elected.run(shutdown).await;
                            Ok(())
                        });
                    }
                    tasks.spawn(snapshot_driver(
                        Arc::clone(manager),
                        Arc::clone(&elected),
                        pool.clone(),
                        snapshot_rx,
                        config.snapshot_interval(),
                        shutdown.clone(),
                    ));
                    leader = Some(elected);
                }
                None => warn!("snapshots enabled but no store configured; not snapshotting"),
            }
        }

        Ok(Self {
            pool,
            cache,
            seq_map,
            registry,
            snapshot,
            leader,
            health,
            shutdown,
            tasks,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn is_snapshot_leader(&self) -> bool {
        self.leader.as_ref().is_some_and(|l| l.is_leader())
    }

    pub fn health_report(&self) -> HealthReport {
        self.health
            .report(self.cache.current(), self.cache.previous())
    }

    /// Force one snapshot now, regardless of leadership.
    pub async fn save_snapshot(&self) -> Result<()> {
        match &self.snapshot {
            Some(manager) => manager.save(&self.pool).await,
            None => Err(Error::State("no snapshot store configured")),
        }
    }

    /// Block until a task fails. A clean return means shutdown was asked.
    pub async fn wait(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.shutdown.cancel();
                    return Err(e);
                }
                Err(_) => {
                    self.shutdown.cancel();
                    return Err(Error::State("node task panicked"));
                }
            }
        }
        Ok(())
    }

    /// Graceful stop: drain the scanner once more, close subscriptions,
    /// flush the sequence map, let the lease lapse.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "task failed during shutdown"),
                Err(e) => warn!(error = %e, "task panicked during shutdown"),
            }
        }
        let seq_map = Arc::clone(&self.seq_map);
        tokio::task::spawn_blocking(move || seq_map.flush()).await??;
        Ok(())
    }
}

/// Saves a snapshot on the sequence-driven trigger or the timed interval,
/// but only while holding the leader lease.
async fn snapshot_driver(
    manager: Arc<SnapshotManager>,
    leader: Arc<SnapshotLeader>,
    pool: Pool,
    mut attempts: mpsc::Receiver<()>,
    interval: Option<std::time::Duration>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let timed = async {
            match interval {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = attempts.recv() => {}
            _ = timed => {}
        }
        if !leader.is_leader() {
            continue;
        }
        match manager.save(&pool).await {
            Ok(()) => {}
            Err(Error::SnapshotPending) => {}
            Err(e) => warn!(error = %e, "snapshot save failed"),
        }
    }
}

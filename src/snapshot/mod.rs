//! Snapshot production and restore.
//!
//! A snapshot is a sanitized copy of the database: vacuumed into a temp
//! file, stripped of every HarmonyLite artifact, vacuumed again, and
//! uploaded under one fixed object name. A node restores when the log has
//! discarded sequences it still needs.

pub mod leader;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::db::cdc;
use crate::db::pool::Pool;
use crate::error::{Error, Result};
use crate::replicator::find_stream_gap;
use crate::seqmap::SequenceMap;
use crate::snapshot::store::SnapshotStore;

/// Fixed object name; every upload replaces it.
pub const SNAPSHOT_OBJECT: &str = "snapshot.db";

const TEMP_PREFIX: &str = "harmonylite-snapshot-";
const TEMP_CLEANUP_ATTEMPTS: u32 = 5;
const TEMP_CLEANUP_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Idle,
    Preparing,
    Uploading,
    Cleaning,
    Restoring,
}

pub struct SnapshotManager {
    db_path: PathBuf,
    store: Arc<dyn SnapshotStore>,
    busy: tokio::sync::Mutex<()>,
    state: Mutex<SnapshotState>,
}

impl SnapshotManager {
    pub fn new(db_path: impl Into<PathBuf>, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        Arc::new(Self {
            db_path: db_path.into(),
            store,
            busy: tokio::sync::Mutex::new(()),
            state: Mutex::new(SnapshotState::Idle),
        })
    }

    pub fn state(&self) -> SnapshotState {
        *self.state.lock()
    }

    fn set_state(&self, state: SnapshotState) {
        *self.state.lock() = state;
    }

    /// Produce and upload one snapshot. [`Error::SnapshotPending`] when a
    /// save is already running.
    pub async fn save(&self, pool: &Pool) -> Result<()> {
        let _busy = self.busy.try_lock().map_err(|_| Error::SnapshotPending)?;

        self.set_state(SnapshotState::Preparing);
        let result = self.save_inner(pool).await;
        self.set_state(SnapshotState::Idle);
        result
    }

    async fn save_inner(&self, pool: &Pool) -> Result<()> {
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        let snapshot_path = dir.path().join(SNAPSHOT_OBJECT);

        let pool = pool.clone();
        let dest = snapshot_path.clone();
        tokio::task::spawn_blocking(move || sanitized_copy(&pool, &dest)).await??;

        self.set_state(SnapshotState::Uploading);
        self.store.upload(SNAPSHOT_OBJECT, &snapshot_path).await?;
        info!(object = SNAPSHOT_OBJECT, "snapshot uploaded");

        self.set_state(SnapshotState::Cleaning);
        cleanup_temp_dir(dir.keep()).await;
        Ok(())
    }

    /// Restore the database file from the store when any stream has
    /// discarded sequences this node still needs.
    ///
    /// Runs at startup, before the connection pool exists, so the file swap
    /// is exclusive by construction. After a successful restore the caller
    /// reinstalls CDC and recomputes the schema hash.
    pub async fn restore_if_needed(
        &self,
        broker: &dyn Broker,
        streams: &[String],
        seq_map: &Arc<SequenceMap>,
    ) -> Result<bool> {
        let Some(gap) = find_stream_gap(broker, streams, seq_map).await? else {
            return Ok(false);
        };
        warn!(
            stream = %gap.stream,
            needed = gap.needed,
            first = gap.first,
            "log truncated past local checkpoint; restoring from snapshot"
        );

        self.set_state(SnapshotState::Restoring);
        let result = self.restore_inner(broker, streams, seq_map).await;
        self.set_state(SnapshotState::Idle);
        result
    }

    async fn restore_inner(
        &self,
        broker: &dyn Broker,
        streams: &[String],
        seq_map: &Arc<SequenceMap>,
    ) -> Result<bool> {
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        let local = dir.path().join(SNAPSHOT_OBJECT);
        match self.store.download(&local, SNAPSHOT_OBJECT).await {
            Ok(()) => {}
            Err(Error::NoSnapshot) => {
                warn!("no snapshot in store; continuing from the retained log");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        // Swap in the snapshot and drop stale journal sidecars.
        tokio::fs::copy(&local, &self.db_path).await?;
        for suffix in ["-wal", "-shm"] {
            let sidecar = sidecar_path(&self.db_path, suffix);
            match tokio::fs::remove_file(&sidecar).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // The snapshot already contains everything up to the log's horizon;
        // resume from the oldest retained message instead of re-replaying.
        let mut floors = Vec::with_capacity(streams.len());
        for stream in streams {
            floors.push((stream.clone(), broker.first_sequence(stream).await?));
        }
        let seq_map = Arc::clone(seq_map);
        tokio::task::spawn_blocking(move || -> Result<()> {
            for (stream, first) in floors {
                seq_map.save(&stream, first.saturating_sub(1))?;
            }
            Ok(())
        })
        .await??;

        cleanup_temp_dir(dir.keep()).await;
        info!("database restored from snapshot");
        Ok(true)
    }
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `VACUUM INTO` a copy, strip HarmonyLite tables and triggers, vacuum.
fn sanitized_copy(pool: &Pool, dest: &Path) -> Result<()> {
    {
        let conn = pool.borrow()?;
        let dest_str = dest
            .to_str()
            .ok_or(Error::State("snapshot path is not valid UTF-8"))?;
        conn.execute("VACUUM INTO ?1", [dest_str])?;
    }
    let copy = Connection::open(dest)?;
    cdc::remove_artifacts(&copy)?;
    copy.execute_batch("VACUUM")?;
    Ok(())
}

async fn cleanup_temp_dir(path: PathBuf) {
    for attempt in 1..=TEMP_CLEANUP_ATTEMPTS {
        match std::fs::remove_dir_all(&path) {
            Ok(()) => return,
            Err(e) if attempt == TEMP_CLEANUP_ATTEMPTS => {
                warn!(path = %path.display(), error = %e, "leaving snapshot temp dir behind");
            }
            Err(_) => tokio::time::sleep(TEMP_CLEANUP_BACKOFF).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::StreamConfig;
    use crate::db::schema::inspect_tables;
    use crate::snapshot::store::FsSnapshotStore;

    fn seeded_pool(dir: &Path) -> Pool {
        let pool = Pool::new(dir.join("t.db"), 2);
        {
            let conn = pool.borrow().unwrap();
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO users VALUES (1, 'Alice');",
            )
            .unwrap();
            let tables = inspect_tables(&conn, &["users".to_owned()]).unwrap();
            cdc::install(&conn, &tables).unwrap();
            conn.execute("INSERT INTO users VALUES (2, 'Bob')", [])
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn snapshots_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsSnapshotStore::new(store_dir.path()).unwrap());
        let pool = seeded_pool(dir.path());
        let manager = SnapshotManager::new(dir.path().join("t.db"), store.clone());

        manager.save(&pool).await.unwrap();
        assert_eq!(manager.state(), SnapshotState::Idle);

        // Pull the object back and verify contents.
        let check = dir.path().join("check.db");
        store.download(&check, SNAPSHOT_OBJECT).await.unwrap();
        let conn = Connection::open(&check).unwrap();
        let users: i64 = conn
            .query_row("SELECT count(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(users, 2);
        let artifacts: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name GLOB '__harmonylite__*'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(artifacts, 0);
    }

    #[tokio::test]
    async fn restore_skips_without_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsSnapshotStore::new(store_dir.path()).unwrap());
        let manager = SnapshotManager::new(dir.path().join("t.db"), store);

        let broker = MemoryBroker::new();
        broker
            .ensure_stream(
                StreamConfig {
                    name: "s-1".into(),
                    max_msgs: 16,
                    replicas: 1,
                },
                false,
            )
            .await
            .unwrap();
        let seq_map = Arc::new(SequenceMap::open(dir.path().join("seq.map")).unwrap());

        let restored = manager
            .restore_if_needed(&*broker, &["s-1".to_owned()], &seq_map)
            .await
            .unwrap();
        assert!(!restored);
    }

    #[tokio::test]
    async fn gap_with_snapshot_restores_and_fast_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsSnapshotStore::new(store_dir.path()).unwrap());
        let pool = seeded_pool(dir.path());
        let manager = SnapshotManager::new(dir.path().join("t.db"), store);
        manager.save(&pool).await.unwrap();
        drop(pool);

        // A stream that truncated past this node's checkpoint.
        let broker = MemoryBroker::new();
        broker
            .ensure_stream(
                StreamConfig {
                    name: "s-1".into(),
                    max_msgs: 2,
                    replicas: 1,
                },
                false,
            )
            .await
            .unwrap();
        for _ in 0..10 {
            broker.publish("s-1", b"m".to_vec()).await.unwrap();
        }
        let seq_map = Arc::new(SequenceMap::open(dir.path().join("seq.map")).unwrap());

        let restored = manager
            .restore_if_needed(&*broker, &["s-1".to_owned()], &seq_map)
            .await
            .unwrap();
        assert!(restored);
        // Checkpoint fast-forwarded to just before the oldest retained.
        assert_eq!(seq_map.get("s-1"), 8);

        // Restored file is the sanitized snapshot.
        let conn = Connection::open(dir.path().join("t.db")).unwrap();
        let users: i64 = conn
            .query_row("SELECT count(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(users, 2);
        let artifacts: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name GLOB '__harmonylite__*'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(artifacts, 0);
    }

    #[tokio::test]
    async fn gap_without_snapshot_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsSnapshotStore::new(store_dir.path()).unwrap());
        let manager = SnapshotManager::new(dir.path().join("t.db"), store);

        let broker = MemoryBroker::new();
        broker
            .ensure_stream(
                StreamConfig {
                    name: "s-1".into(),
                    max_msgs: 1,
                    replicas: 1,
                },
                false,
            )
            .await
            .unwrap();
        for _ in 0..5 {
            broker.publish("s-1", b"m".to_vec()).await.unwrap();
        }
        let seq_map = Arc::new(SequenceMap::open(dir.path().join("seq.map")).unwrap());
        let restored = manager
            .restore_if_needed(&*broker, &["s-1".to_owned()], &seq_map)
            .await
            .unwrap();
        assert!(!restored);
    }

    #[tokio::test]
    async fn concurrent_save_reports_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsSnapshotStore::new(store_dir.path()).unwrap());
        let pool = seeded_pool(dir.path());
        let manager = SnapshotManager::new(dir.path().join("t.db"), store);

        let _busy = manager.busy.try_lock().unwrap();
        let err = manager.save(&pool).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotPending));
    }
}

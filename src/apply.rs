//! Applies decoded remote changes to the local database.
//!
//! Insert and update are a row-granular upsert; delete is by primary key.
//! Last arrival wins: the shard's ordering is the conflict policy. Events
//! whose schema hash the node does not recognize pause the stream via nak
//! until a local recompute converges.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::params_from_iter;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::db::cache::SchemaCache;
use crate::db::cdc::{self, ReplayGuard};
use crate::db::pool::Pool;
use crate::db::schema::TableInfo;
use crate::error::{Error, Result};
use crate::event::{ChangeLogEvent, OpType};
use crate::health::Health;
use crate::registry::SchemaRegistry;
use crate::replicator::find_stream_gap;
use crate::seqmap::SequenceMap;

pub const DEFAULT_SCHEMA_NAK_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_SCHEMA_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(300);

struct MismatchState {
    #[allow(dead_code)]
    first_mismatch_at: Instant,
    last_recompute_at: Instant,
}

pub struct ApplyEngine {
    pool: Pool,
    cache: Arc<SchemaCache>,
    broker: Arc<dyn Broker>,
    streams: Vec<String>,
    seq_map: Arc<SequenceMap>,
    registry: Option<Arc<SchemaRegistry>>,
    health: Arc<Health>,
    mismatch: Mutex<Option<MismatchState>>,
    schema_nak_delay: Duration,
    schema_recompute_interval: Duration,
}

impl ApplyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Pool,
        cache: Arc<SchemaCache>,
        broker: Arc<dyn Broker>,
        streams: Vec<String>,
        seq_map: Arc<SequenceMap>,
        registry: Option<Arc<SchemaRegistry>>,
        health: Arc<Health>,
        schema_nak_delay: Duration,
        schema_recompute_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            cache,
            broker,
            streams,
            seq_map,
            registry,
            health,
            mismatch: Mutex::new(None),
            schema_nak_delay,
            schema_recompute_interval,
        })
    }

    /// Apply one event. `Err(SchemaMismatch)` asks the caller to nak and
    /// redeliver later; `Err(StreamGap)` is fatal so a restart restores.
    pub async fn apply(&self, event: &ChangeLogEvent) -> Result<()> {
        if !self.cache.matches(&event.schema_hash) {
            return self.on_mismatch(event).await;
        }
        self.clear_mismatch();
        self.apply_event(event).await
    }

    fn clear_mismatch(&self) {
        let was_paused = self.mismatch.lock().take().is_some();
        if was_paused {
            info!("schema converged; apply resumed");
        }
        self.health.set_paused(false);
    }

    async fn on_mismatch(&self, event: &ChangeLogEvent) -> Result<()> {
        let now = Instant::now();
        let recompute_due = {
            let mut state = self.mismatch.lock();
            match state.as_mut() {
                None => {
                    warn!(
                        incoming = %event.schema_hash,
                        current = %self.cache.current(),
                        "unknown schema hash; apply paused"
                    );
                    *state = Some(MismatchState {
                        first_mismatch_at: now,
                        last_recompute_at: now,
                    });
                    true
                }
                Some(s) => {
                    if now.duration_since(s.last_recompute_at)
                        >= self.schema_recompute_interval
                    {
                        s.last_recompute_at = now;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if recompute_due {
            // A truncated stream cannot be waited out: abort so the next
            // start restores from snapshot.
            if let Some(gap) =
                find_stream_gap(&*self.broker, &self.streams, &self.seq_map).await?
            {
                return Err(gap.into());
            }
            let hash = {
                let cache = Arc::clone(&self.cache);
                let pool = self.pool.clone();
                tokio::task::spawn_blocking(move || -> Result<String> {
                    let hash = cache.recompute()?;
                    let conn = pool.borrow()?;
                    cdc::write_schema_version(&conn, &hash)?;
                    Ok(hash)
                })
                .await??
            };
            if let Some(registry) = &self.registry {
                if let Err(e) = registry.publish(&hash, &self.cache.previous()).await {
                    warn!(error = %e, "failed to publish recomputed schema state");
                }
            }
            if self.cache.matches(&event.schema_hash) {
                self.clear_mismatch();
                return self.apply_event(event).await;
            }
        }

        self.health.set_paused(true);
        Err(Error::SchemaMismatch {
            incoming: event.schema_hash.clone(),
            retry_after: self.schema_nak_delay,
        })
    }

    /// Run the row change on a blocking worker; the handle borrow and the
    /// write transaction can both stall behind other writers.
    async fn apply_event(&self, event: &ChangeLogEvent) -> Result<()> {
        let info = self
            .cache
            .table(&event.table_name)
            .ok_or_else(|| Error::UnknownTable(event.table_name.clone()))?;
        let pool = self.pool.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || apply_row(&pool, &info, &event)).await??;
        self.health.note_applied(cdc::now_micros());
        Ok(())
    }
}

/// Upsert or delete one row inside a replay-guarded transaction.
fn apply_row(pool: &Pool, info: &TableInfo, event: &ChangeLogEvent) -> Result<()> {
    let conn = pool.borrow()?;
    let tx = conn.unchecked_transaction()?;
    let guard = ReplayGuard::enter(&tx)?;
    match event.op {
        OpType::Insert | OpType::Update => {
            let columns: Vec<&str> = event.row.keys().map(String::as_str).collect();
            if columns.is_empty() {
                return Err(Error::State("event row has no columns"));
            }
            let col_list = columns
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let conflict = info
                .primary_key
                .iter()
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(", ");
            let updates: Vec<String> = columns
                .iter()
                .filter(|&&c| !info.is_pk(c))
                .map(|&c| format!("{0} = excluded.{0}", quote(c)))
                .collect();
            let action = if updates.is_empty() {
                "NOTHING".to_owned()
            } else {
                format!("UPDATE SET {}", updates.join(", "))
            };
            let sql = format!(
                "INSERT INTO {} ({col_list}) VALUES ({placeholders}) ON CONFLICT({conflict}) DO {action}",
                quote(&event.table_name),
            );
            tx.execute(&sql, params_from_iter(event.row.values()))?;
        }
        OpType::Delete => {
            let pk_values = event.pk_values(&info.primary_key)?;
            let clauses = info
                .primary_key
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!("DELETE FROM {} WHERE {clauses}", quote(&event.table_name));
            tx.execute(&sql, params_from_iter(pk_values))?;
        }
    }
    drop(guard);
    tx.commit()?;
    Ok(())
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::db::schema::inspect_tables;
    use crate::event::CellValue;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: Pool,
        engine: Arc<ApplyEngine>,
        cache: Arc<SchemaCache>,
        health: Arc<Health>,
    }

    async fn fixture(recompute_interval: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(dir.path().join("t.db"), 2);
        {
            let conn = pool.borrow().unwrap();
            conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
                .unwrap();
            let tables = inspect_tables(&conn, &["users".to_owned()]).unwrap();
            cdc::install(&conn, &tables).unwrap();
        }
        let cache =
            SchemaCache::initialize(pool.clone(), vec!["users".to_owned()]).unwrap();
        let broker = MemoryBroker::new();
        let seq_map = Arc::new(
            SequenceMap::open(dir.path().join("seq.map")).unwrap(),
        );
        let health = Arc::new(Health::default());
        let engine = ApplyEngine::new(
            pool.clone(),
            cache.clone(),
            broker,
            vec![],
            seq_map,
            None,
            health.clone(),
            Duration::from_millis(50),
            recompute_interval,
        );
        Fixture {
            _dir: dir,
            pool,
            engine,
            cache,
            health,
        }
    }

    fn event(op: OpType, id: i64, name: &str, hash: &str) -> ChangeLogEvent {
        let mut row = BTreeMap::new();
        row.insert("id".to_owned(), CellValue::Integer(id));
        row.insert("name".to_owned(), CellValue::Text(name.to_owned()));
        ChangeLogEvent {
            id: 1,
            op,
            table_name: "users".to_owned(),
            row,
            schema_hash: hash.to_owned(),
        }
    }

    fn name_of(pool: &Pool, id: i64) -> Option<String> {
        use rusqlite::OptionalExtension;
        let conn = pool.borrow().unwrap();
        conn.query_row("SELECT name FROM users WHERE id = ?1", [id], |r| r.get(0))
            .optional()
            .unwrap()
    }

    #[tokio::test]
    async fn insert_then_update_is_an_upsert() {
        let fx = fixture(DEFAULT_SCHEMA_RECOMPUTE_INTERVAL).await;
        let hash = fx.cache.current();
        fx.engine
            .apply(&event(OpType::Insert, 1, "Alice", &hash))
            .await
            .unwrap();
        assert_eq!(name_of(&fx.pool, 1).as_deref(), Some("Alice"));

        // Update arriving as an insert for an existing row still lands.
        fx.engine
            .apply(&event(OpType::Insert, 1, "Bob", &hash))
            .await
            .unwrap();
        assert_eq!(name_of(&fx.pool, 1).as_deref(), Some("Bob"));

        fx.engine
            .apply(&event(OpType::Delete, 1, "Bob", &hash))
            .await
            .unwrap();
        assert_eq!(name_of(&fx.pool, 1), None);
    }

    #[tokio::test]
    async fn apply_does_not_feed_the_change_log() {
        let fx = fixture(DEFAULT_SCHEMA_RECOMPUTE_INTERVAL).await;
        let hash = fx.cache.current();
        fx.engine
            .apply(&event(OpType::Insert, 1, "Alice", &hash))
            .await
            .unwrap();
        let conn = fx.pool.borrow().unwrap();
        let logged: i64 = conn
            .query_row(
                "SELECT count(*) FROM __harmonylite__users_change_log",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(logged, 0);
    }

    #[tokio::test]
    async fn legacy_events_without_hash_apply() {
        let fx = fixture(DEFAULT_SCHEMA_RECOMPUTE_INTERVAL).await;
        fx.engine
            .apply(&event(OpType::Insert, 1, "Alice", ""))
            .await
            .unwrap();
        assert_eq!(name_of(&fx.pool, 1).as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn unknown_hash_pauses_and_local_ddl_resumes() {
        let fx = fixture(Duration::from_millis(0)).await;
        // Hash of the schema as it will be after the DDL below, computed
        // against a scratch database standing in for the upgraded sender.
        let future_hash = {
            let scratch = rusqlite::Connection::open_in_memory().unwrap();
            scratch
                .execute_batch(
                    "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)",
                )
                .unwrap();
            let t = inspect_tables(&scratch, &["users".to_owned()]).unwrap();
            crate::db::schema::compute_schema_hash(&t)
        };
        // The local schema still hashes to its pre-DDL value, so the future
        // hash is unknown even after the first forced recompute.
        let ev = event(OpType::Insert, 1, "Alice", &future_hash);
        let err = fx.engine.apply(&ev).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert!(fx.health.is_paused());

        // Apply the same DDL locally; the next attempt recomputes, matches,
        // and applies without restart.
        fx.pool
            .borrow()
            .unwrap()
            .execute_batch("ALTER TABLE users ADD COLUMN email TEXT")
            .unwrap();
        fx.engine.apply(&ev).await.unwrap();
        assert!(!fx.health.is_paused());
        assert_eq!(name_of(&fx.pool, 1).as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn mismatch_respects_the_recompute_interval() {
        let fx = fixture(Duration::from_secs(3600)).await;
        let ev = event(OpType::Insert, 1, "Alice", "f00d");
        assert!(fx.engine.apply(&ev).await.is_err());
        // Even though the hash would now match nothing, the second attempt
        // inside the interval does not recompute; it just retries.
        let before = fx.cache.current();
        assert!(fx.engine.apply(&ev).await.is_err());
        assert_eq!(fx.cache.current(), before);
    }
}

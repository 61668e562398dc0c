//! Scans pending change-log rows and hands them to the replicator.
//!
//! Rows are read in global commit order, published shard-by-key, and flipped
//! to the published state only after the log acknowledges them. A failed
//! publish leaves rows pending; the next pass retries them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::cache::SchemaCache;
use crate::db::cdc;
use crate::db::pool::Pool;
use crate::error::{Error, Result};
use crate::event::{CellValue, ChangeLogEvent, Envelope, OpType};
use crate::health::Health;
use crate::replicator::Replicator;
use crate::shard::stable_hash;

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    /// Max rows drained per batch.
    pub max_changes: usize,
    /// Age after which published rows are deleted.
    pub cleanup_interval: Duration,
    /// When set, poll on this interval instead of watching the filesystem.
    pub polling_interval: Option<Duration>,
    /// Forced wake-up while watching, for missed notifications. None
    /// disables the fallback tick.
    pub wake_timeout: Option<Duration>,
}

/// One pending row joined from the global and per-table logs.
#[derive(Debug)]
pub struct PendingChange {
    pub global_id: i64,
    pub log_id: i64,
    pub event: ChangeLogEvent,
}

pub struct ChangeScanner {
    pool: Pool,
    cache: Arc<SchemaCache>,
    node_id: u64,
    opts: ScannerOptions,
    health: Arc<Health>,
}

impl ChangeScanner {
    pub fn new(
        pool: Pool,
        cache: Arc<SchemaCache>,
        node_id: u64,
        opts: ScannerOptions,
        health: Arc<Health>,
    ) -> Self {
        Self {
            pool,
            cache,
            node_id,
            opts,
            health,
        }
    }

    /// Read up to `max_changes` pending rows across all watched tables,
    /// ordered by global commit id.
    pub fn scan_batch(&self) -> Result<Vec<PendingChange>> {
        let conn = self.pool.borrow()?;
        let tx = conn.unchecked_transaction()?;
        let mut batch = Vec::new();
        for table in self.cache.watched_tables() {
            let info = self
                .cache
                .table(table)
                .ok_or_else(|| Error::UnknownTable(table.clone()))?;
            let cols: Vec<String> = info.columns.iter().map(|c| c.name.clone()).collect();
            let val_list = cols
                .iter()
                .map(|c| format!("l.\"val_{}\"", c.replace('"', "\"\"")))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT g.id, l.id, l.type, {val_list}
                 FROM \"{log}\" l
                 JOIN \"{global}\" g ON g.change_table_id = l.id AND g.table_name = ?1
                 WHERE l.state = 0
                 ORDER BY g.id ASC
                 LIMIT ?2",
                log = cdc::log_table_name(table),
                global = cdc::GLOBAL_TABLE,
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![table, self.opts.max_changes as i64],
                |r| {
                    let global_id: i64 = r.get(0)?;
                    let log_id: i64 = r.get(1)?;
                    let op: String = r.get(2)?;
                    let mut row = BTreeMap::new();
                    for (i, col) in cols.iter().enumerate() {
                        row.insert(col.clone(), CellValue::from(r.get_ref(3 + i)?));
                    }
                    Ok((global_id, log_id, op, row))
                },
            )?;
            for row in rows {
                let (global_id, log_id, op, row) = row?;
                batch.push(PendingChange {
                    global_id,
                    log_id,
                    event: ChangeLogEvent {
                        id: log_id,
                        op: OpType::parse(&op)?,
                        table_name: table.clone(),
                        row,
                        schema_hash: String::new(),
                    },
                });
            }
        }
        tx.commit()?;
        batch.sort_by_key(|c| c.global_id);
        batch.truncate(self.opts.max_changes);
        Ok(batch)
    }

    /// Flip acknowledged rows to the published state.
    pub fn mark_published(&self, acked: &[(String, i64)]) -> Result<()> {
        if acked.is_empty() {
            return Ok(());
        }
        let conn = self.pool.borrow()?;
        let tx = conn.unchecked_transaction()?;
        for (table, log_id) in acked {
            tx.execute(
                &format!(
                    "UPDATE \"{}\" SET state = 1 WHERE id = ?1",
                    cdc::log_table_name(table)
                ),
                [log_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Age out published rows.
    pub fn cleanup(&self) -> Result<usize> {
        let cutoff = cdc::now_micros() - self.opts.cleanup_interval.as_micros() as i64;
        let conn = self.pool.borrow()?;
        let tables: Vec<String> = self.cache.watched_tables().to_vec();
        cdc::cleanup_published(&conn, &tables, cutoff)
    }

    /// Publish every pending change, oldest first. Stops early on a publish
    /// failure; pending rows are retried on the next pass. Database work
    /// runs on blocking workers so a contended scan cannot stall the
    /// runtime.
    pub async fn drain(self: &Arc<Self>, replicator: &Replicator) -> Result<()> {
        loop {
            let batch = {
                let this = Arc::clone(self);
                tokio::task::spawn_blocking(move || this.scan_batch()).await??
            };
            if batch.is_empty() {
                return Ok(());
            }
            let schema_hash = self.cache.current();
            let mut acked: Vec<(String, i64)> = Vec::with_capacity(batch.len());
            let mut publish_err = None;
            for change in batch {
                let mut event = change.event;
                event.schema_hash = schema_hash.clone();
                let info = self
                    .cache
                    .table(&event.table_name)
                    .ok_or_else(|| Error::UnknownTable(event.table_name.clone()))?;
                let pk = event.pk_values(&info.primary_key)?;
                let hash = stable_hash(&event.table_name, &pk);
                let table_name = event.table_name.clone();
                let payload = Envelope {
                    from_node_id: self.node_id,
                    payload: event,
                }
                .encode()?;
                match replicator.publish(hash, payload).await {
                    Ok((stream, sequence)) => {
                        debug!(table = %table_name, %stream, sequence, "published change");
                        self.health.note_published(cdc::now_micros());
                        acked.push((table_name, change.log_id));
                    }
                    Err(e) => {
                        warn!(error = %e, table = %table_name, "publish failed; will retry");
                        publish_err = Some(e);
                        break;
                    }
                }
            }
            {
                let this = Arc::clone(self);
                tokio::task::spawn_blocking(move || this.mark_published(&acked)).await??;
            }
            if publish_err.is_some() {
                return Ok(());
            }
        }
    }

    /// Scanner main loop: wake on database activity (or timer), drain, and
    /// periodically age out published rows.
    pub async fn run(
        self: Arc<Self>,
        replicator: Arc<Replicator>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let (activity_tx, mut activity_rx) = tokio::sync::mpsc::unbounded_channel();
        let _watcher = if self.opts.polling_interval.is_none() {
            match self.spawn_watcher(activity_tx.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "filesystem watch unavailable; falling back to polling");
                    None
                }
            }
        } else {
            None
        };

        let tick = self
            .opts
            .polling_interval
            .or(if _watcher.is_some() {
                self.opts.wake_timeout
            } else {
                Some(Duration::from_millis(500))
            })
            .unwrap_or(Duration::from_secs(30));
        let mut next_cleanup = Instant::now() + self.opts.cleanup_interval;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Final drain so acknowledged work is not left pending.
                    if let Err(e) = self.drain(&replicator).await {
                        warn!(error = %e, "final scanner drain failed");
                    }
                    return Ok(());
                }
                _ = activity_rx.recv() => {}
                _ = tokio::time::sleep(tick) => {}
            }
            // Coalesce bursts of notifications into one pass.
            while activity_rx.try_recv().is_ok() {}

            self.drain(&replicator).await?;

            if Instant::now() >= next_cleanup {
                let this = Arc::clone(&self);
                let cleaned = tokio::task::spawn_blocking(move || this.cleanup())
                    .await
                    .map_err(Error::from)
                    .and_then(|r| r);
                match cleaned {
                    Ok(removed) if removed > 0 => {
                        debug!(removed, "aged out published change-log rows")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "change-log cleanup failed"),
                }
                next_cleanup = Instant::now() + self.opts.cleanup_interval;
            }
        }
    }

    fn spawn_watcher(
        &self,
        activity_tx: tokio::sync::mpsc::UnboundedSender<()>,
    ) -> Result<notify::RecommendedWatcher> {
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = activity_tx.send(());
                }
            })?;
        // Watch the directory so -wal/-shm activity is seen too.
        let dir = self
            .pool
            .db_path()
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::inspect_tables;

    fn scanner_fixture(max_changes: usize) -> (tempfile::TempDir, ChangeScanner) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(dir.path().join("t.db"), 2);
        {
            let conn = pool.borrow().unwrap();
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
                 CREATE TABLE orders (id INTEGER PRIMARY KEY, amount REAL);",
            )
            .unwrap();
            let tables =
                inspect_tables(&conn, &["users".to_owned(), "orders".to_owned()]).unwrap();
            cdc::install(&conn, &tables).unwrap();
        }
        let cache = SchemaCache::initialize(
            pool.clone(),
            vec!["users".to_owned(), "orders".to_owned()],
        )
        .unwrap();
        let scanner = ChangeScanner::new(
            pool,
            cache,
            1,
            ScannerOptions {
                max_changes,
                cleanup_interval: Duration::from_secs(60),
                polling_interval: Some(Duration::from_millis(25)),
                wake_timeout: None,
            },
            Arc::new(Health::default()),
        );
        (dir, scanner)
    }

    #[test]
    fn batch_follows_global_commit_order_across_tables() {
        let (_dir, scanner) = scanner_fixture(512);
        {
            let conn = scanner.pool.borrow().unwrap();
            conn.execute("INSERT INTO users VALUES (1, 'a')", []).unwrap();
            conn.execute("INSERT INTO orders VALUES (1, 9.5)", []).unwrap();
            conn.execute("INSERT INTO users VALUES (2, 'b')", []).unwrap();
        }
        let batch = scanner.scan_batch().unwrap();
        let tables: Vec<&str> = batch.iter().map(|c| c.event.table_name.as_str()).collect();
        assert_eq!(tables, ["users", "orders", "users"]);
        assert!(batch.windows(2).all(|w| w[0].global_id < w[1].global_id));
        assert_eq!(batch[1].event.row["amount"], CellValue::Real(9.5));
    }

    #[test]
    fn batch_respects_the_size_limit() {
        let (_dir, scanner) = scanner_fixture(2);
        {
            let conn = scanner.pool.borrow().unwrap();
            for i in 0..5 {
                conn.execute("INSERT INTO users VALUES (?1, 'x')", [i]).unwrap();
            }
        }
        let batch = scanner.scan_batch().unwrap();
        assert_eq!(batch.len(), 2);
        // The oldest changes come first.
        assert_eq!(batch[0].event.row["id"], CellValue::Integer(0));
        assert_eq!(batch[1].event.row["id"], CellValue::Integer(1));
    }

    #[test]
    fn published_rows_leave_the_pending_scan() {
        let (_dir, scanner) = scanner_fixture(512);
        {
            let conn = scanner.pool.borrow().unwrap();
            conn.execute("INSERT INTO users VALUES (1, 'a')", []).unwrap();
            conn.execute("INSERT INTO users VALUES (2, 'b')", []).unwrap();
        }
        let batch = scanner.scan_batch().unwrap();
        assert_eq!(batch.len(), 2);
        scanner
            .mark_published(&[("users".to_owned(), batch[0].log_id)])
            .unwrap();

        let rest = scanner.scan_batch().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].log_id, batch[1].log_id);

        // Published rows age out once the interval passes; pending stay.
        let removed = {
            let conn = scanner.pool.borrow().unwrap();
            cdc::cleanup_published(
                &conn,
                &["users".to_owned()],
                cdc::now_micros() + 1,
            )
            .unwrap()
        };
        assert_eq!(removed, 1);
        assert_eq!(scanner.scan_batch().unwrap().len(), 1);
    }

    #[test]
    fn delete_events_carry_the_old_row() {
        let (_dir, scanner) = scanner_fixture(512);
        {
            let conn = scanner.pool.borrow().unwrap();
            conn.execute("INSERT INTO users VALUES (7, 'gone')", []).unwrap();
            conn.execute("DELETE FROM users WHERE id = 7", []).unwrap();
        }
        let batch = scanner.scan_batch().unwrap();
        assert_eq!(batch.len(), 2);
        let delete = &batch[1].event;
        assert_eq!(delete.op, OpType::Delete);
        assert_eq!(delete.row["id"], CellValue::Integer(7));
        assert_eq!(delete.row["name"], CellValue::Text("gone".to_owned()));
    }
}

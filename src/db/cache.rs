//! Process-wide cache of the schema hash.
//!
//! Keeps the current hash plus the one it replaced. The previous hash is the
//! rolling-upgrade window: events stamped with it are still applied, so a
//! peer one schema step behind keeps replicating.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::db::pool::Pool;
use crate::db::schema::{self, TableInfo};
use crate::error::Result;

#[derive(Default)]
struct CacheInner {
    current: String,
    previous: String,
    tables: HashMap<String, TableInfo>,
}

pub struct SchemaCache {
    pool: Pool,
    table_names: Vec<String>,
    inner: RwLock<CacheInner>,
}

impl SchemaCache {
    /// Introspect `tables` and seed the cache. `previous` starts empty.
    pub fn initialize(pool: Pool, tables: Vec<String>) -> Result<Arc<Self>> {
        let cache = Arc::new(Self {
            pool,
            table_names: tables,
            inner: RwLock::new(CacheInner::default()),
        });
        cache.recompute()?;
        Ok(cache)
    }

    pub fn current(&self) -> String {
        self.inner.read().current.clone()
    }

    pub fn previous(&self) -> String {
        self.inner.read().previous.clone()
    }

    /// Whether an incoming event hash is acceptable: empty (legacy sender),
    /// the current hash, or the immediately previous one.
    pub fn matches(&self, hash: &str) -> bool {
        if hash.is_empty() {
            return true;
        }
        let inner = self.inner.read();
        hash == inner.current || hash == inner.previous
    }

    /// Introspected description of one watched table.
    pub fn table(&self, name: &str) -> Option<TableInfo> {
        self.inner.read().tables.get(name).cloned()
    }

    pub fn watched_tables(&self) -> &[String] {
        &self.table_names
    }

    /// Re-introspect and re-hash. When the hash changed and a hash was
    /// already held, the old one becomes `previous`. Returns the new hash.
    pub fn recompute(&self) -> Result<String> {
        let described = {
            let conn = self.pool.borrow()?;
            schema::inspect_tables(&conn, &self.table_names)?
        };
        let hash = schema::compute_schema_hash(&described);

        let mut inner = self.inner.write();
        if hash != inner.current && !inner.current.is_empty() {
            inner.previous = std::mem::take(&mut inner.current);
        }
        inner.current = hash.clone();
        inner.tables = described
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        Ok(hash)
    }
}

//! Change-data-capture installation and teardown.
//!
//! For each watched table this creates a sidecar change-log table and three
//! AFTER triggers, plus one global table giving total local commit order and
//! a single-row schema-version table. Everything lives under the
//! `__harmonylite__` prefix so it can be dropped wholesale.

use chrono::Utc;
use rusqlite::Connection;

use crate::db::schema::{self, TableInfo};
use crate::error::Result;
use crate::event::OpType;

pub const PREFIX: &str = "__harmonylite__";
pub const GLOBAL_TABLE: &str = "__harmonylite___change_log_global";
pub const SCHEMA_VERSION_TABLE: &str = "__harmonylite___schema_version";
pub const REPLAY_GUARD_TABLE: &str = "__harmonylite___replay_guard";

/// Microseconds since epoch, as stored in `created_at` columns.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub fn log_table_name(table: &str) -> String {
    format!("{PREFIX}{table}_change_log")
}

fn trigger_name(table: &str, op: OpType) -> String {
    format!("{PREFIX}{table}_change_log_on_{op}")
}

/// Quote an identifier for embedding in generated SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for embedding in generated SQL.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// Microsecond wall clock, computable inside a trigger body.
const SQL_NOW_MICROS: &str =
    "CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER)";

// The replay sentinel is a row inserted inside the apply transaction and
// removed before commit. Triggers fired by that transaction see it and skip;
// every other connection reads the committed (empty) table and captures.
fn guard_clause() -> String {
    format!(
        "(SELECT count(*) FROM {}) = 0",
        quote_ident(REPLAY_GUARD_TABLE)
    )
}

fn create_replay_guard_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY);\n",
        quote_ident(REPLAY_GUARD_TABLE)
    )
}

fn create_log_table_sql(table: &TableInfo) -> String {
    let log = quote_ident(&log_table_name(&table.name));
    let mut cols = String::new();
    for col in &table.columns {
        cols.push_str(&format!(
            "    {} {},\n",
            quote_ident(&format!("val_{}", col.name)),
            col.declared_type
        ));
    }
    let index = quote_ident(&format!("{}{}_change_log_state_idx", PREFIX, table.name));
    format!(
        "CREATE TABLE IF NOT EXISTS {log} (\n\
         \x20   id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
         {cols}\
         \x20   type TEXT NOT NULL,\n\
         \x20   created_at INTEGER NOT NULL,\n\
         \x20   state INTEGER NOT NULL DEFAULT 0\n\
         );\n\
         CREATE INDEX IF NOT EXISTS {index} ON {log} (state);\n"
    )
}

fn create_global_table_sql() -> String {
    let global = quote_ident(GLOBAL_TABLE);
    let index = quote_ident(&format!("{GLOBAL_TABLE}_table_idx"));
    format!(
        "CREATE TABLE IF NOT EXISTS {global} (\n\
         \x20   id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
         \x20   change_table_id INTEGER NOT NULL,\n\
         \x20   table_name TEXT NOT NULL\n\
         );\n\
         CREATE INDEX IF NOT EXISTS {index} ON {global} (table_name, change_table_id);\n"
    )
}

fn create_schema_version_table_sql() -> String {
    let table = quote_ident(SCHEMA_VERSION_TABLE);
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   id INTEGER PRIMARY KEY CHECK (id = 1),\n\
         \x20   schema_hash TEXT NOT NULL,\n\
         \x20   updated_at INTEGER NOT NULL,\n\
         \x20   harmonylite_version TEXT NOT NULL\n\
         );\n"
    )
}

fn create_trigger_sql(table: &TableInfo, op: OpType) -> String {
    // DELETE captures the OLD row; INSERT/UPDATE capture NEW.
    let row_ref = match op {
        OpType::Insert | OpType::Update => "NEW",
        OpType::Delete => "OLD",
    };
    let name = quote_ident(&trigger_name(&table.name, op));
    let target = quote_ident(&table.name);
    let log = quote_ident(&log_table_name(&table.name));
    let global = quote_ident(GLOBAL_TABLE);
    let guard = guard_clause();

    let mut log_cols = Vec::with_capacity(table.columns.len() + 3);
    let mut log_vals = Vec::with_capacity(table.columns.len() + 3);
    for col in &table.columns {
        log_cols.push(quote_ident(&format!("val_{}", col.name)));
        log_vals.push(format!("{row_ref}.{}", quote_ident(&col.name)));
    }
    log_cols.extend(["\"type\"".into(), "\"created_at\"".into(), "\"state\"".into()]);
    log_vals.extend([
        quote_literal(op.as_str()),
        SQL_NOW_MICROS.to_owned(),
        "0".to_owned(),
    ]);

    format!(
        "DROP TRIGGER IF EXISTS {name};\n\
         CREATE TRIGGER {name}\n\
         AFTER {op_upper} ON {target}\n\
         WHEN {guard}\n\
         BEGIN\n\
         \x20   INSERT INTO {log} ({cols}) VALUES ({vals});\n\
         \x20   INSERT INTO {global} (change_table_id, table_name) VALUES (last_insert_rowid(), {tname});\n\
         END;\n",
        op_upper = op.as_str().to_ascii_uppercase(),
        cols = log_cols.join(", "),
        vals = log_vals.join(", "),
        tname = quote_literal(&table.name),
    )
}

/// Install the CDC sidecar for `tables`: log tables, global ordering table,
/// schema-version table, and fresh triggers. Idempotent. Returns the schema
/// hash recorded in the version table.
pub fn install(conn: &Connection, tables: &[TableInfo]) -> Result<String> {
    let mut ddl = String::from("BEGIN;\n");
    ddl.push_str(&create_replay_guard_table_sql());
    ddl.push_str(&create_global_table_sql());
    ddl.push_str(&create_schema_version_table_sql());
    for table in tables {
        ddl.push_str(&create_log_table_sql(table));
        for op in [OpType::Insert, OpType::Update, OpType::Delete] {
            ddl.push_str(&create_trigger_sql(table, op));
        }
    }
    ddl.push_str("COMMIT;\n");
    conn.execute_batch(&ddl)?;

    let hash = schema::compute_schema_hash(tables);
    write_schema_version(conn, &hash)?;
    Ok(hash)
}

/// Record the current schema hash in the single-row version table.
pub fn write_schema_version(conn: &Connection, hash: &str) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (id, schema_hash, updated_at, harmonylite_version)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 schema_hash = excluded.schema_hash,
                 updated_at = excluded.updated_at,
                 harmonylite_version = excluded.harmonylite_version",
            quote_ident(SCHEMA_VERSION_TABLE)
        ),
        rusqlite::params![hash, now_micros(), env!("CARGO_PKG_VERSION")],
    )?;
    Ok(())
}

pub fn read_schema_version(conn: &Connection) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    let hash = conn
        .query_row(
            &format!(
                "SELECT schema_hash FROM {} WHERE id = 1",
                quote_ident(SCHEMA_VERSION_TABLE)
            ),
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hash)
}

/// Suppresses capture for the surrounding transaction while alive.
///
/// Must be entered on a connection with an open transaction; the sentinel
/// row stays uncommitted, so triggers fired by other connections never see
/// it and keep capturing. The row is removed on drop, and a rollback after
/// a failed apply clears it as well.
pub struct ReplayGuard<'c> {
    conn: &'c Connection,
}

impl<'c> ReplayGuard<'c> {
    pub fn enter(conn: &'c Connection) -> Result<Self> {
        conn.execute(
            &format!(
                "INSERT INTO {} (id) VALUES (1) ON CONFLICT(id) DO NOTHING",
                quote_ident(REPLAY_GUARD_TABLE)
            ),
            [],
        )?;
        Ok(Self { conn })
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.execute(
            &format!("DELETE FROM {}", quote_ident(REPLAY_GUARD_TABLE)),
            [],
        ) {
            tracing::warn!(error = %e, "failed to clear replay guard");
        }
    }
}

/// Drop every HarmonyLite table and trigger. Used by `--cleanup` and by
/// snapshot sanitization. Idempotent.
pub fn remove_artifacts(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT type, name FROM sqlite_master WHERE name GLOB '__harmonylite__*'",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    let mut triggers = Vec::new();
    let mut tables = Vec::new();
    for row in rows {
        let (kind, name) = row?;
        match kind.as_str() {
            "trigger" => triggers.push(name),
            "table" => tables.push(name),
            _ => {}
        }
    }
    drop(stmt);

    for name in triggers {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(&name)))?;
    }
    for name in tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
    }
    Ok(())
}

/// Delete published log rows older than `cutoff_micros`, and global rows
/// that no longer reference a log row. Returns rows removed from log tables.
pub fn cleanup_published(
    conn: &Connection,
    tables: &[String],
    cutoff_micros: i64,
) -> Result<usize> {
    let mut removed = 0;
    for table in tables {
        let log = quote_ident(&log_table_name(table));
        removed += conn.execute(
            &format!("DELETE FROM {log} WHERE state = 1 AND created_at < ?1"),
            [cutoff_micros],
        )?;
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE table_name = ?1 AND change_table_id NOT IN (SELECT id FROM {log})",
                quote_ident(GLOBAL_TABLE)
            ),
            [table],
        )?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::inspect_tables;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let tables = inspect_tables(&conn, &["users".to_owned()]).unwrap();
        install(&conn, &tables).unwrap();
        conn
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |r| {
            r.get(0)
        })
        .unwrap()
    }

    #[test]
    fn install_is_idempotent() {
        let conn = setup();
        let tables = inspect_tables(&conn, &["users".to_owned()]).unwrap();
        let h1 = install(&conn, &tables).unwrap();
        let h2 = install(&conn, &tables).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(read_schema_version(&conn).unwrap().unwrap(), h1);
    }

    #[test]
    fn each_write_logs_one_row_per_table_and_global() {
        let conn = setup();
        conn.execute("INSERT INTO users VALUES (1, 'Alice')", [])
            .unwrap();
        conn.execute("UPDATE users SET name = 'Bob' WHERE id = 1", [])
            .unwrap();
        conn.execute("DELETE FROM users WHERE id = 1", []).unwrap();

        assert_eq!(count(&conn, "__harmonylite__users_change_log"), 3);
        assert_eq!(count(&conn, GLOBAL_TABLE), 3);

        let kinds: Vec<(String, i64, i64)> = conn
            .prepare(
                "SELECT type, state, created_at FROM __harmonylite__users_change_log ORDER BY id",
            )
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0].0, "insert");
        assert_eq!(kinds[1].0, "update");
        assert_eq!(kinds[2].0, "delete");
        for (_, state, created_at) in kinds {
            assert_eq!(state, 0);
            assert!(created_at > 0);
        }
    }

    #[test]
    fn delete_captures_the_old_row() {
        let conn = setup();
        conn.execute("INSERT INTO users VALUES (1, 'Alice')", [])
            .unwrap();
        conn.execute("DELETE FROM users WHERE id = 1", []).unwrap();
        let (id, name): (i64, String) = conn
            .query_row(
                "SELECT val_id, val_name FROM __harmonylite__users_change_log WHERE type = 'delete'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((id, name.as_str()), (1, "Alice"));
    }

    #[test]
    fn replay_guard_suppresses_capture_while_held() {
        let conn = setup();
        {
            let tx = conn.unchecked_transaction().unwrap();
            {
                let _guard = ReplayGuard::enter(&tx).unwrap();
                tx.execute("INSERT INTO users VALUES (1, 'Alice')", [])
                    .unwrap();
            }
            tx.commit().unwrap();
        }
        assert_eq!(count(&conn, "__harmonylite__users_change_log"), 0);
        assert_eq!(count(&conn, REPLAY_GUARD_TABLE), 0);

        // Guard gone: capture resumes on the same connection.
        conn.execute("INSERT INTO users VALUES (2, 'Bob')", [])
            .unwrap();
        assert_eq!(count(&conn, "__harmonylite__users_change_log"), 1);
    }

    #[test]
    fn replay_guard_stays_invisible_to_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let a = Connection::open(&path).unwrap();
        a.pragma_update(None, "journal_mode", "wal").unwrap();
        a.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let tables = inspect_tables(&a, &["users".to_owned()]).unwrap();
        install(&a, &tables).unwrap();
        let b = Connection::open(&path).unwrap();

        let tx = a.unchecked_transaction().unwrap();
        let _guard = ReplayGuard::enter(&tx).unwrap();
        // The sentinel is uncommitted: another connection reads it as empty,
        // so its triggers would keep capturing.
        let seen: i64 = b
            .query_row(
                &format!("SELECT count(*) FROM \"{REPLAY_GUARD_TABLE}\""),
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(seen, 0);
        drop(_guard);
        drop(tx); // rollback

        // A rolled-back apply leaves capture intact.
        a.execute("INSERT INTO users VALUES (1, 'Alice')", [])
            .unwrap();
        assert_eq!(count(&a, "__harmonylite__users_change_log"), 1);
    }

    #[test]
    fn cleanup_removes_only_old_published_rows() {
        let conn = setup();
        conn.execute("INSERT INTO users VALUES (1, 'a')", []).unwrap();
        conn.execute("INSERT INTO users VALUES (2, 'b')", []).unwrap();
        // Publish the first row only.
        conn.execute(
            "UPDATE __harmonylite__users_change_log SET state = 1 WHERE val_id = 1",
            [],
        )
        .unwrap();

        let future = now_micros() + 1_000_000;
        let removed =
            cleanup_published(&conn, &["users".to_owned()], future).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(count(&conn, "__harmonylite__users_change_log"), 1);
        assert_eq!(count(&conn, GLOBAL_TABLE), 1);

        // Pending rows are never aged out.
        let removed =
            cleanup_published(&conn, &["users".to_owned()], future).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn remove_artifacts_twice_reaches_the_same_state() {
        let conn = setup();
        conn.execute("INSERT INTO users VALUES (1, 'a')", []).unwrap();
        remove_artifacts(&conn).unwrap();
        remove_artifacts(&conn).unwrap();

        let leftovers: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name GLOB '__harmonylite__*'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(leftovers, 0);
        // User data untouched, and writes no longer capture.
        assert_eq!(count(&conn, "users"), 1);
        conn.execute("INSERT INTO users VALUES (2, 'b')", []).unwrap();
    }
}

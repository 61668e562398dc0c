//! Table introspection and the schema hash.
//!
//! The hash is the cluster-wide fingerprint of the watched tables: nodes
//! refuse to apply changes stamped with a hash they do not recognize. Its
//! input format is frozen; see [`compute_schema_hash`].

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
}

/// Normalized description of one watched table. Columns are sorted by name;
/// `primary_key` keeps the declared key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn is_pk(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }
}

/// Describe `tables`, sorted by table name, columns sorted by column name.
pub fn inspect_tables(conn: &Connection, tables: &[String]) -> Result<Vec<TableInfo>> {
    let mut names: Vec<&String> = tables.iter().collect();
    names.sort();
    names.dedup();

    let mut out = Vec::with_capacity(names.len());
    for name in names {
        out.push(inspect_table(conn, name)?);
    }
    Ok(out)
}

fn inspect_table(conn: &Connection, table: &str) -> Result<TableInfo> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY name",
    )?;
    let mut columns = Vec::new();
    let mut pk_positions: Vec<(i64, String)> = Vec::new();
    let rows = stmt.query_map([table], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, bool>(2)?,
            r.get::<_, i64>(3)?,
        ))
    })?;
    for row in rows {
        let (name, declared_type, not_null, pk) = row?;
        if pk > 0 {
            pk_positions.push((pk, name.clone()));
        }
        columns.push(ColumnInfo {
            name,
            declared_type,
            not_null,
        });
    }
    if columns.is_empty() {
        return Err(Error::UnknownTable(table.to_owned()));
    }
    if pk_positions.is_empty() {
        return Err(Error::NoPrimaryKey(table.to_owned()));
    }
    pk_positions.sort();
    Ok(TableInfo {
        name: table.to_owned(),
        columns,
        primary_key: pk_positions.into_iter().map(|(_, n)| n).collect(),
    })
}

/// All user tables eligible for watching: everything except SQLite internals
/// and this crate's own sidecar tables.
pub fn list_user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table'
           AND name NOT LIKE 'sqlite|_%' ESCAPE '|'
           AND name NOT GLOB '__harmonylite__*'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Collapse a declared column type onto SQLite's canonical affinity name,
/// so `INT`, `BIGINT` and `INTEGER` all hash identically.
pub fn normalize_type(declared: &str) -> &'static str {
    let upper = declared.to_ascii_uppercase();
    if upper.contains("INT") {
        "INTEGER"
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        "TEXT"
    } else if upper.is_empty() || upper.contains("BLOB") {
        "BLOB"
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        "REAL"
    } else {
        "NUMERIC"
    }
}

/// Hex SHA-256 over the normalized table descriptions.
///
/// Per table (sorted by name): the table name, then for every column sorted
/// by name `|{name}:{type}:{not_null}:{is_pk}`, then a newline. Frozen:
/// every node in a cluster must compute byte-identical input.
pub fn compute_schema_hash(tables: &[TableInfo]) -> String {
    let mut sorted: Vec<&TableInfo> = tables.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for table in sorted {
        hasher.update(table.name.as_bytes());
        for col in &table.columns {
            hasher.update(
                format!(
                    "|{}:{}:{}:{}",
                    col.name,
                    normalize_type(&col.declared_type),
                    col.not_null,
                    table.is_pk(&col.name)
                )
                .as_bytes(),
            );
        }
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, bio TEXT);
             CREATE TABLE pairs (a INT NOT NULL, b VARCHAR(10) NOT NULL, v BLOB, PRIMARY KEY (b, a));",
        )
        .unwrap();
        conn
    }

    #[test]
    fn inspection_is_sorted_and_keyed() {
        let conn = open();
        let tables =
            inspect_tables(&conn, &["users".to_owned(), "pairs".to_owned()]).unwrap();
        assert_eq!(tables[0].name, "pairs");
        assert_eq!(tables[1].name, "users");
        let cols: Vec<&str> = tables[1].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(cols, ["bio", "id", "name"]);
        // Declared key order, not column order.
        assert_eq!(tables[0].primary_key, ["b", "a"]);
    }

    #[test]
    fn missing_table_is_an_error() {
        let conn = open();
        assert!(matches!(
            inspect_tables(&conn, &["ghost".to_owned()]),
            Err(Error::UnknownTable(_))
        ));
    }

    #[test]
    fn rowid_table_without_key_is_rejected() {
        let conn = open();
        conn.execute_batch("CREATE TABLE bare (x TEXT)").unwrap();
        assert!(matches!(
            inspect_tables(&conn, &["bare".to_owned()]),
            Err(Error::NoPrimaryKey(_))
        ));
    }

    #[test]
    fn type_normalization_follows_affinity() {
        assert_eq!(normalize_type("INT"), "INTEGER");
        assert_eq!(normalize_type("bigint"), "INTEGER");
        assert_eq!(normalize_type("VARCHAR(64)"), "TEXT");
        assert_eq!(normalize_type("clob"), "TEXT");
        assert_eq!(normalize_type(""), "BLOB");
        assert_eq!(normalize_type("blob"), "BLOB");
        assert_eq!(normalize_type("DOUBLE PRECISION"), "REAL");
        assert_eq!(normalize_type("DECIMAL(10,2)"), "NUMERIC");
    }

    #[test]
    fn hash_ignores_declaration_spelling() {
        let a = Connection::open_in_memory().unwrap();
        a.execute_batch("CREATE TABLE t (id INT PRIMARY KEY, n VARCHAR(5))")
            .unwrap();
        let b = Connection::open_in_memory().unwrap();
        b.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, n TEXT)")
            .unwrap();
        let ta = inspect_tables(&a, &["t".to_owned()]).unwrap();
        let tb = inspect_tables(&b, &["t".to_owned()]).unwrap();
        assert_eq!(compute_schema_hash(&ta), compute_schema_hash(&tb));
    }

    #[test]
    fn hash_sees_schema_changes() {
        let conn = open();
        let before =
            compute_schema_hash(&inspect_tables(&conn, &["users".to_owned()]).unwrap());
        conn.execute_batch("ALTER TABLE users ADD COLUMN email TEXT")
            .unwrap();
        let after =
            compute_schema_hash(&inspect_tables(&conn, &["users".to_owned()]).unwrap());
        assert_ne!(before, after);
        assert_eq!(after.len(), 64);
    }

    #[test]
    fn user_table_listing_skips_sidecars() {
        let conn = open();
        conn.execute_batch(
            "CREATE TABLE __harmonylite__users_change_log (id INTEGER PRIMARY KEY)",
        )
        .unwrap();
        assert_eq!(list_user_tables(&conn).unwrap(), ["pairs", "users"]);
    }
}

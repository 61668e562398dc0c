//! Wire-level change events.
//!
//! Every captured row change travels the log as an [`Envelope`] wrapping a
//! [`ChangeLogEvent`]. The encoding is self-describing MessagePack with named
//! fields, so peers can skip fields they do not know about.

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::ToSql;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};

/// Logical operation type captured in the change logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OpType::Insert),
            "update" => Ok(OpType::Update),
            "delete" => Ok(OpType::Delete),
            _ => Err(Error::State("unknown change-log operation type")),
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column value as carried on the wire. Mirrors SQLite's storage
/// classes; there is no richer typing than the database itself has.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_unit(),
            CellValue::Integer(i) => serializer.serialize_i64(*i),
            CellValue::Real(f) => serializer.serialize_f64(*f),
            CellValue::Text(s) => serializer.serialize_str(s),
            CellValue::Blob(b) => serializer.serialize_bytes(b),
        }
    }
}

struct CellValueVisitor;

impl<'de> Visitor<'de> for CellValueVisitor {
    type Value = CellValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer, float, string, byte array, or nil")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<CellValue, E> {
        i64::try_from(v)
            .map(CellValue::Integer)
            .map_err(|_| E::custom("integer out of i64 range"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Real(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Text(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Text(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Blob(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Blob(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<CellValue, E> {
        Ok(CellValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        d: D,
    ) -> std::result::Result<CellValue, D::Error> {
        d.deserialize_any(CellValueVisitor)
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        d.deserialize_any(CellValueVisitor)
    }
}

impl From<ValueRef<'_>> for CellValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(i) => CellValue::Integer(i),
            ValueRef::Real(f) => CellValue::Real(f),
            ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => CellValue::Blob(b.to_vec()),
        }
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CellValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            CellValue::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            CellValue::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            CellValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            CellValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// A single captured row change, as recorded in a change-log table at the
/// origin node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeLogEvent {
    /// Change-log row id at the origin.
    pub id: i64,
    #[serde(rename = "type")]
    pub op: OpType,
    pub table_name: String,
    /// Column name to value. NEW row for insert/update, OLD row for delete.
    pub row: BTreeMap<String, CellValue>,
    /// Schema hash of the sender. Empty for legacy peers.
    #[serde(default)]
    pub schema_hash: String,
}

impl ChangeLogEvent {
    /// Primary-key values in the declared key order. Errors if the row is
    /// missing any key column.
    pub fn pk_values<'a>(&'a self, pk_columns: &[String]) -> Result<Vec<&'a CellValue>> {
        pk_columns
            .iter()
            .map(|c| {
                self.row
                    .get(c)
                    .ok_or(Error::State("event row is missing a primary-key column"))
            })
            .collect()
    }
}

/// Outermost wire record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub from_node_id: u64,
    pub payload: ChangeLogEvent,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

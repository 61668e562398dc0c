//! Deterministic routing of changes onto replication shards.
//!
//! All changes to the same `(table, primary key)` must land on the same
//! durable stream so that per-key ordering holds cluster-wide. The hash is
//! therefore frozen: rapidhash over the UTF-8 table name followed by a
//! tagged, length-prefixed canonical encoding of each key value in declared
//! key order. Changing this function is a wire-format break.

use crate::event::CellValue;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// Stable 64-bit hash of a table name and its primary-key values.
pub fn stable_hash(table_name: &str, pk_values: &[&CellValue]) -> u64 {
    let mut buf = Vec::with_capacity(table_name.len() + pk_values.len() * 16);
    buf.extend_from_slice(table_name.as_bytes());
    for value in pk_values {
        match value {
            CellValue::Null => buf.push(TAG_NULL),
            CellValue::Integer(i) => {
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&i.to_be_bytes());
            }
            CellValue::Real(f) => {
                buf.push(TAG_REAL);
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            CellValue::Text(s) => {
                buf.push(TAG_TEXT);
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            CellValue::Blob(b) => {
                buf.push(TAG_BLOB);
                buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                buf.extend_from_slice(b);
            }
        }
    }
    rapidhash::rapidhash(&buf)
}

/// One-based shard id for a hash.
pub fn shard_for(hash: u64, shards: u64) -> u64 {
    hash % shards.max(1) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_shard() {
        let id = CellValue::Integer(1);
        let a = stable_hash("users", &[&id]);
        let b = stable_hash("users", &[&id]);
        assert_eq!(a, b);
        assert_eq!(shard_for(a, 4), shard_for(b, 4));
    }

    #[test]
    fn table_name_participates() {
        let id = CellValue::Integer(1);
        assert_ne!(stable_hash("users", &[&id]), stable_hash("orders", &[&id]));
    }

    #[test]
    fn value_kind_participates() {
        // "1" as text must not collide with 1 as integer by construction.
        let int = CellValue::Integer(49);
        let text = CellValue::Text("1".to_owned());
        assert_ne!(stable_hash("t", &[&int]), stable_hash("t", &[&text]));
    }

    #[test]
    fn shard_ids_are_one_based_and_bounded() {
        for hash in [0u64, 1, u64::MAX, 12345678901234567] {
            let shard = shard_for(hash, 8);
            assert!((1..=8).contains(&shard));
        }
        assert_eq!(shard_for(5, 1), 1);
    }

    #[test]
    fn composite_keys_hash_in_order() {
        let a = CellValue::Integer(1);
        let b = CellValue::Integer(2);
        assert_ne!(stable_hash("t", &[&a, &b]), stable_hash("t", &[&b, &a]));
    }
}

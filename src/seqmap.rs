//! Persistent per-stream checkpoint of the last applied sequence.
//!
//! The map is the at-most-once gate for the apply path: a message whose
//! sequence is at or below the stored floor has already been applied and is
//! dropped. Entries only ever grow.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

pub struct SequenceMap {
    path: PathBuf,
    inner: RwLock<HashMap<String, u64>>,
}

impl SequenceMap {
    /// Open the map at `path`, decoding existing content. A missing or empty
    /// file starts an empty map.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => rmp_serde::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    /// Last applied sequence for a stream; 0 when the stream is unknown.
    pub fn get(&self, stream: &str) -> u64 {
        self.inner.read().get(stream).copied().unwrap_or(0)
    }

    /// Raise the floor for `stream` to `seq` if higher, persisting the whole
    /// map atomically. Returns the stored value, which never decreases.
    pub fn save(&self, stream: &str, seq: u64) -> Result<u64> {
        let mut map = self.inner.write();
        let entry = map.entry(stream.to_owned()).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
        let stored = *entry;
        Self::persist(&map, &self.path)?;
        Ok(stored)
    }

    /// Rewrite the current state. Called once more at shutdown.
    pub fn flush(&self) -> Result<()> {
        let map = self.inner.read();
        Self::persist(&map, &self.path)
    }

    /// A point-in-time copy, used for stream-gap checks.
    pub fn entries(&self) -> HashMap<String, u64> {
        self.inner.read().clone()
    }

    fn persist(map: &HashMap<String, u64>, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&rmp_serde::to_vec(map)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

//! Object-store contract for snapshots.
//!
//! An upload replaces the object; nothing richer is assumed of a backend.
//! The bundled backend is a plain directory, which is also what the test
//! clusters share. S3/WebDAV/SFTP backends implement the same trait.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{Broker, KvBucket};
use crate::error::{Error, Result};

const BROKER_BUCKET: &str = "harmonylite-snapshots";

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store `local` under `name`, replacing any existing object.
    async fn upload(&self, name: &str, local: &Path) -> Result<()>;
    /// Fetch `name` into `local`. [`Error::NoSnapshot`] when absent.
    async fn download(&self, local: &Path, name: &str) -> Result<()>;
}

/// Directory-backed store.
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn upload(&self, name: &str, local: &Path) -> Result<()> {
        let target = self.root.join(name);
        let staged = self.root.join(format!("{name}.partial"));
        tokio::fs::copy(local, &staged).await?;
        tokio::fs::rename(&staged, &target).await?;
        Ok(())
    }

    async fn download(&self, local: &Path, name: &str) -> Result<()> {
        let source = self.root.join(name);
        match tokio::fs::copy(&source, local).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NoSnapshot),
            Err(e) => Err(e.into()),
        }
    }
}

/// Broker-native store: the snapshot lives in a KV bucket on the log
/// backend itself, so no shared filesystem or external object store is
/// needed.
pub struct BrokerSnapshotStore {
    kv: Arc<dyn KvBucket>,
}

impl BrokerSnapshotStore {
    pub async fn open(broker: &dyn Broker) -> Result<Self> {
        let kv = broker.kv_bucket(BROKER_BUCKET).await?;
        Ok(Self { kv })
    }
}

#[async_trait]
impl SnapshotStore for BrokerSnapshotStore {
    async fn upload(&self, name: &str, local: &Path) -> Result<()> {
        let bytes = tokio::fs::read(local).await?;
        self.kv.put(name, bytes, None).await?;
        Ok(())
    }

    async fn download(&self, local: &Path, name: &str) -> Result<()> {
        match self.kv.get(name).await? {
            Some(entry) => {
                tokio::fs::write(local, entry.value).await?;
                Ok(())
            }
            None => Err(Error::NoSnapshot),
        }
    }
}

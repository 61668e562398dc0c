//! Cluster-visible schema state, one KV entry per node.
//!
//! Entries carry a TTL so nodes that stop refreshing drop out of the
//! cluster view on their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::broker::{Broker, KvBucket};
use crate::db::cdc::now_micros;
use crate::error::Result;

pub const REGISTRY_BUCKET: &str = "harmonylite-schema-registry";
pub const ENTRY_TTL: Duration = Duration::from_secs(300);

/// One node's published schema state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSchemaState {
    pub node_id: u64,
    pub schema_hash: String,
    #[serde(default)]
    pub previous_hash: String,
    pub harmonylite_version: String,
    /// Microseconds since epoch.
    pub updated_at: i64,
}

/// Result of comparing every node's hash against a reference.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub reference_hash: String,
    pub nodes: usize,
    pub mismatched: Vec<u64>,
}

pub struct SchemaRegistry {
    kv: Arc<dyn KvBucket>,
    node_id: u64,
}

impl SchemaRegistry {
    pub async fn open(broker: &dyn Broker, node_id: u64) -> Result<Arc<Self>> {
        let kv = broker.kv_bucket(REGISTRY_BUCKET).await?;
        Ok(Arc::new(Self { kv, node_id }))
    }

    fn key(node_id: u64) -> String {
        format!("node-{node_id}")
    }

    /// Write this node's current state, refreshing its TTL.
    pub async fn publish(&self, schema_hash: &str, previous_hash: &str) -> Result<()> {
        let state = NodeSchemaState {
            node_id: self.node_id,
            schema_hash: schema_hash.to_owned(),
            previous_hash: previous_hash.to_owned(),
            harmonylite_version: env!("CARGO_PKG_VERSION").to_owned(),
            updated_at: now_micros(),
        };
        let value = serde_json::to_vec(&state)?;
        self.kv
            .put(&Self::key(self.node_id), value, Some(ENTRY_TTL))
            .await?;
        Ok(())
    }

    /// Every live node's state. Malformed entries are skipped.
    pub async fn cluster_state(&self) -> Result<HashMap<u64, NodeSchemaState>> {
        let mut out = HashMap::new();
        for key in self.kv.keys().await? {
            // The bucket also carries the snapshot-leader lease.
            if !key.starts_with("node-") {
                continue;
            }
            let Some(entry) = self.kv.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<NodeSchemaState>(&entry.value) {
                Ok(state) => {
                    out.insert(state.node_id, state);
                }
                Err(e) => warn!(%key, error = %e, "skipping malformed schema-registry entry"),
            }
        }
        Ok(out)
    }

    /// Compare all nodes against an arbitrary reference hash. A cluster of
    /// at most one node is consistent by definition.
    pub async fn consistency_report(&self) -> Result<ConsistencyReport> {
        let state = self.cluster_state().await?;
        let mut nodes: Vec<&NodeSchemaState> = state.values().collect();
        nodes.sort_by_key(|n| n.node_id);
        let reference_hash = nodes
            .first()
            .map(|n| n.schema_hash.clone())
            .unwrap_or_default();
        let mismatched: Vec<u64> = nodes
            .iter()
            .filter(|n| n.schema_hash != reference_hash)
            .map(|n| n.node_id)
            .collect();
        Ok(ConsistencyReport {
            consistent: mismatched.is_empty(),
            reference_hash,
            nodes: state.len(),
            mismatched,
        })
    }
}

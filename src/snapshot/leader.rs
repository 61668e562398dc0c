//! Lease-based election of the one node allowed to upload snapshots.
//!
//! The lease is a TTL'd KV entry holding the leader's node id. Holding it
//! is renewed on a heartbeat of a third of the TTL; losing any renewal
//! demotes immediately, and an expired lease is free for the taking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, KvBucket};
use crate::error::Result;
use crate::registry::REGISTRY_BUCKET;

pub const LEADER_KEY: &str = "snapshot-leader";
pub const DEFAULT_LEADER_TTL: Duration = Duration::from_secs(30);

pub struct SnapshotLeader {
    kv: Arc<dyn KvBucket>,
    node_id: u64,
    ttl: Duration,
    leader: AtomicBool,
}

impl SnapshotLeader {
    pub async fn open(broker: &dyn Broker, node_id: u64, ttl: Duration) -> Result<Arc<Self>> {
        let kv = broker.kv_bucket(REGISTRY_BUCKET).await?;
        Ok(Arc::new(Self {
            kv,
            node_id,
            ttl,
            leader: AtomicBool::new(false),
        }))
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }

    /// Election loop. Runs until shutdown; afterwards the lease simply
    /// expires for the next candidate.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let heartbeat = (self.ttl / 3).max(Duration::from_secs(1));
        let mut tick = tokio::time::interval(heartbeat);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.leader.store(false, Ordering::Relaxed);
                    return;
                }
                _ = tick.tick() => {}
            }
            let now_leader = self.try_acquire().await;
            let was_leader = self.leader.swap(now_leader, Ordering::Relaxed);
            if now_leader && !was_leader {
                info!(node_id = self.node_id, "acquired snapshot leadership");
            } else if !now_leader && was_leader {
                info!(node_id = self.node_id, "lost snapshot leadership");
            }
        }
    }

    /// One acquire-or-renew attempt. Any failure counts as not leading.
    async fn try_acquire(&self) -> bool {
        let me = self.node_id.to_string().into_bytes();
        match self.kv.get(LEADER_KEY).await {
            Ok(None) => self
                .kv
                .create(LEADER_KEY, me, Some(self.ttl))
                .await
                .is_ok(),
            Ok(Some(entry)) if entry.value == me => self
                .kv
                .update(LEADER_KEY, me, entry.revision, Some(self.ttl))
                .await
                .is_ok(),
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(error = %e, "lease lookup failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    #[tokio::test]
    async fn only_one_candidate_leads() {
        let broker = MemoryBroker::new();
        let ttl = Duration::from_secs(5);
        let a = SnapshotLeader::open(&*broker, 1, ttl).await.unwrap();
        let b = SnapshotLeader::open(&*broker, 2, ttl).await.unwrap();

        assert!(a.try_acquire().await);
        assert!(!b.try_acquire().await);
        // Renewal keeps working for the holder.
        assert!(a.try_acquire().await);
        assert!(!b.try_acquire().await);
    }

    #[tokio::test]
    async fn lease_expiry_hands_over() {
        let broker = MemoryBroker::new();
        let ttl = Duration::from_millis(30);
        let a = SnapshotLeader::open(&*broker, 1, ttl).await.unwrap();
        let b = SnapshotLeader::open(&*broker, 2, ttl).await.unwrap();

        assert!(a.try_acquire().await);
        // A stops renewing; after the TTL the lease is free.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(b.try_acquire().await);
        assert!(!a.try_acquire().await);
    }

    #[tokio::test]
    async fn election_loop_reports_leadership() {
        let broker = MemoryBroker::new();
        let leader = SnapshotLeader::open(&*broker, 1, Duration::from_secs(3))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&leader).run(shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !leader.is_leader() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(leader.is_leader());

        shutdown.cancel();
        task.await.unwrap();
        assert!(!leader.is_leader());
    }
}

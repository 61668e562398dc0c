//! Stream management, publishing, and per-shard consumption.
//!
//! Changes are routed onto `shards` durable streams; each stream is consumed
//! serially so per-key order (guaranteed by the sharder) is preserved end to
//! end. The sequence map gates redeliveries and self-published messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::apply::ApplyEngine;
use crate::broker::{Broker, StreamConfig};
use crate::error::{Error, Result};
use crate::event::Envelope;
use crate::seqmap::SequenceMap;
use crate::shard::shard_for;

/// Redeliveries before an apply failure is fatal to the node.
pub const MAX_DELIVERIES: u64 = 7;

#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub node_id: u64,
    pub shards: u64,
    pub max_entries: u64,
    pub replicas: usize,
    pub compress: bool,
    pub update_existing: bool,
    /// This node publishes local changes.
    pub publish: bool,
    /// This node applies remote changes.
    pub replicate: bool,
    pub stream_prefix: String,
    /// Redelivery delay for transient apply failures.
    pub retry_nak_delay: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            node_id: 1,
            shards: 1,
            max_entries: 1024,
            replicas: 1,
            compress: true,
            update_existing: false,
            publish: true,
            replicate: true,
            stream_prefix: "harmonylite-change-log".to_owned(),
            retry_nak_delay: Duration::from_secs(1),
        }
    }
}

impl ReplicationOptions {
    pub fn stream_name(&self, shard: u64) -> String {
        if self.compress {
            format!("{}-c-{shard}", self.stream_prefix)
        } else {
            format!("{}-{shard}", self.stream_prefix)
        }
    }

    pub fn stream_names(&self) -> Vec<String> {
        (1..=self.shards.max(1)).map(|s| self.stream_name(s)).collect()
    }
}

/// The first stream whose next needed sequence was already discarded.
#[derive(Debug, Clone)]
pub struct StreamGap {
    pub stream: String,
    pub needed: u64,
    pub first: u64,
}

impl From<StreamGap> for Error {
    fn from(gap: StreamGap) -> Self {
        Error::StreamGap {
            stream: gap.stream,
            needed: gap.needed,
            first: gap.first,
        }
    }
}

/// Compare each stream's oldest retained sequence with the local floor.
pub async fn find_stream_gap(
    broker: &dyn Broker,
    streams: &[String],
    seq_map: &SequenceMap,
) -> Result<Option<StreamGap>> {
    for stream in streams {
        let first = broker.first_sequence(stream).await?;
        let needed = seq_map.get(stream) + 1;
        if needed < first {
            return Ok(Some(StreamGap {
                stream: stream.clone(),
                needed,
                first,
            }));
        }
    }
    Ok(None)
}

pub struct Replicator {
    broker: Arc<dyn Broker>,
    opts: ReplicationOptions,
    seq_map: Arc<SequenceMap>,
    snapshot_tx: mpsc::Sender<()>,
}

impl Replicator {
    /// Validate or create every shard stream and return the replicator.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        opts: ReplicationOptions,
        seq_map: Arc<SequenceMap>,
        snapshot_tx: mpsc::Sender<()>,
    ) -> Result<Arc<Self>> {
        let replicas = opts.replicas.clamp(1, 5);
        for shard in 1..=opts.shards.max(1) {
            let name = opts.stream_name(shard);
            let cfg = StreamConfig {
                name: name.clone(),
                max_msgs: opts.max_entries,
                replicas,
            };
            let accepted = broker.ensure_stream(cfg, opts.update_existing).await?;
            if !accepted {
                warn!(stream = %name, "existing stream config differs; continuing without update");
            }
        }
        Ok(Arc::new(Self {
            broker,
            opts,
            seq_map,
            snapshot_tx,
        }))
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.opts
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.opts.stream_names()
    }

    /// Raise the persistent floor off the async worker: every save fsyncs.
    async fn save_floor(&self, stream: &str, sequence: u64) -> Result<u64> {
        let seq_map = Arc::clone(&self.seq_map);
        let stream = stream.to_owned();
        tokio::task::spawn_blocking(move || seq_map.save(&stream, sequence)).await?
    }

    /// Publish one serialized envelope onto the shard owning `hash`.
    /// Returns the stream and the log-assigned sequence.
    pub async fn publish(&self, hash: u64, payload: Vec<u8>) -> Result<(String, u64)> {
        let shard = shard_for(hash, self.opts.shards);
        let stream = self.opts.stream_name(shard);
        let body = if self.opts.compress {
            zstd::encode_all(&payload[..], 0)?
        } else {
            payload
        };
        let ack = self.broker.publish(&stream, body).await?;

        // Producer watermark: our own messages are dropped on the subscribe
        // path without another apply.
        if self.opts.publish {
            self.save_floor(&stream, ack.sequence).await?;
        }

        let window = (self.opts.max_entries / self.opts.shards.max(1)).max(1);
        if shard == 1 && ack.sequence % window == 0 {
            let _ = self.snapshot_tx.try_send(());
        }
        Ok((stream, ack.sequence))
    }

    /// Consume every shard until shutdown. An apply failure that exhausts
    /// its redeliveries (or a stream gap) terminates the whole set.
    pub async fn run(
        self: Arc<Self>,
        apply: Arc<ApplyEngine>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut set = JoinSet::new();
        for shard in 1..=self.opts.shards.max(1) {
            let this = Arc::clone(&self);
            let apply = Arc::clone(&apply);
            let shutdown = shutdown.clone();
            set.spawn(async move { this.consume_shard(shard, apply, shutdown).await });
        }
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "shard subscription terminated");
                    first_err.get_or_insert(e);
                    shutdown.cancel();
                }
                Err(e) => {
                    error!(error = %e, "shard subscription panicked");
                    first_err.get_or_insert(Error::State("subscription task panicked"));
                    shutdown.cancel();
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn consume_shard(
        &self,
        shard: u64,
        apply: Arc<ApplyEngine>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let stream = self.opts.stream_name(shard);
        let durable = format!("harmonylite-node-{}", self.opts.node_id);
        let mut sub = self.broker.subscribe(&stream, &durable).await?;
        info!(stream = %stream, "subscribed");

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                msg = sub.next() => msg?,
            };
            let sequence = msg.meta.sequence;
            if sequence <= self.seq_map.get(&stream) {
                // Already applied (or self-published); drop.
                sub.ack().await?;
                continue;
            }

            let outcome = self.decode_and_apply(&apply, &msg.payload).await;
            match outcome {
                Ok(()) => {
                    self.save_floor(&stream, sequence).await?;
                    sub.ack().await?;
                }
                Err(Error::SchemaMismatch {
                    incoming,
                    retry_after,
                }) => {
                    debug!(stream = %stream, sequence, %incoming, "schema mismatch; redelivery scheduled");
                    sub.nak(retry_after).await?;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if msg.meta.num_delivered >= MAX_DELIVERIES => {
                    error!(stream = %stream, sequence, error = %e, "apply failed after {MAX_DELIVERIES} deliveries");
                    return Err(e);
                }
                Err(e) => {
                    warn!(stream = %stream, sequence, error = %e, "apply failed; will redeliver");
                    sub.nak(self.opts.retry_nak_delay).await?;
                }
            }
        }
    }

    async fn decode_and_apply(&self, apply: &ApplyEngine, payload: &[u8]) -> Result<()> {
        let bytes = if self.opts.compress {
            zstd::decode_all(payload)?
        } else {
            payload.to_vec()
        };
        let envelope = Envelope::decode(&bytes)?;
        apply.apply(&envelope.payload).await
    }
}

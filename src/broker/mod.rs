//! Client contracts for the backing publish/subscribe log.
//!
//! The core only consumes these traits: durable named streams with
//! per-message sequence metadata, publish acknowledged with the assigned
//! sequence, serial per-stream consumption with ack/nak, and a key-value
//! primitive with per-key TTL and compare-and-set sufficient for leases.
//! Any broker satisfying them can replace the bundled in-process one.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Desired shape of a durable stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    /// Oldest messages are discarded past this count.
    pub max_msgs: u64,
    /// Storage replicas; meaningful only to clustered brokers.
    pub replicas: usize,
}

/// Acknowledgement for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub sequence: u64,
}

/// Metadata delivered with every consumed message.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub stream: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Messages behind this one in the stream.
    pub num_pending: u64,
    /// Delivery attempts for this message, starting at 1.
    pub num_delivered: u64,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Vec<u8>,
    pub meta: MessageMeta,
}

/// Serial consumer over one stream. `next` redelivers the in-flight message
/// until it is acked; later messages are never delivered ahead of it.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Result<Message>;
    /// Acknowledge the in-flight message and advance.
    async fn ack(&mut self) -> Result<()>;
    /// Reject the in-flight message; it is redelivered after `delay`.
    async fn nak(&mut self, delay: Duration) -> Result<()>;
}

/// One key-value entry with its compare-and-set revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub revision: u64,
}

#[async_trait]
pub trait KvBucket: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;
    /// Unconditional write. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64>;
    /// Create only if the key is absent (or expired).
    async fn create(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64>;
    /// Compare-and-set against `revision`.
    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        revision: u64,
        ttl: Option<Duration>,
    ) -> Result<u64>;
    async fn keys(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the stream if absent. On a config mismatch the stream is
    /// updated when `update_existing` is set, otherwise left as found and
    /// reported via the returned flag (false = mismatch left in place).
    async fn ensure_stream(&self, cfg: StreamConfig, update_existing: bool) -> Result<bool>;

    async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<PubAck>;

    /// Durable serial subscription; redelivery state survives resubscribes
    /// under the same durable name.
    async fn subscribe(&self, stream: &str, durable: &str) -> Result<Box<dyn Subscription>>;

    /// Sequence of the oldest retained message; `last + 1` when empty.
    async fn first_sequence(&self, stream: &str) -> Result<u64>;

    /// Open (creating if needed) a named KV bucket.
    async fn kv_bucket(&self, bucket: &str) -> Result<Arc<dyn KvBucket>>;
}

//! In-process broker satisfying the log-backend contract.
//!
//! Streams are bounded ring buffers with monotonically increasing sequences
//! and discard-old retention; consumers are durable serial cursors with
//! delayed redelivery on nak. Buckets implement TTL'd compare-and-set.
//! Cluster tests run several nodes against one instance of this broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::{
    Broker, KvBucket, KvEntry, Message, MessageMeta, PubAck, StreamConfig, Subscription,
};
use crate::error::{Error, Result};

#[derive(Clone)]
struct StoredMsg {
    seq: u64,
    timestamp: DateTime<Utc>,
    payload: Arc<[u8]>,
}

struct StreamData {
    cfg: StreamConfig,
    next_seq: u64,
    msgs: VecDeque<StoredMsg>,
    /// Durable consumer name to next sequence due for delivery.
    consumers: HashMap<String, u64>,
}

struct StreamState {
    data: Mutex<StreamData>,
    publishes: Notify,
}

#[derive(Default)]
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, Arc<StreamState>>>,
    buckets: Mutex<HashMap<String, Arc<MemoryKv>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn stream(&self, name: &str) -> Result<Arc<StreamState>> {
        self.streams
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Broker(format!("stream {name} does not exist")))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_stream(&self, cfg: StreamConfig, update_existing: bool) -> Result<bool> {
        let mut streams = self.streams.lock();
        match streams.get(&cfg.name) {
            None => {
                streams.insert(
                    cfg.name.clone(),
                    Arc::new(StreamState {
                        data: Mutex::new(StreamData {
                            cfg,
                            next_seq: 1,
                            msgs: VecDeque::new(),
                            consumers: HashMap::new(),
                        }),
                        publishes: Notify::new(),
                    }),
                );
                Ok(true)
            }
            Some(state) => {
                let mut data = state.data.lock();
                if data.cfg == cfg {
                    return Ok(true);
                }
                if !update_existing {
                    return Ok(false);
                }
                data.cfg = cfg;
                while data.msgs.len() as u64 > data.cfg.max_msgs {
                    data.msgs.pop_front();
                }
                Ok(true)
            }
        }
    }

    async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<PubAck> {
        let state = self.stream(stream)?;
        let seq = {
            let mut data = state.data.lock();
            let seq = data.next_seq;
            data.next_seq += 1;
            data.msgs.push_back(StoredMsg {
                seq,
                timestamp: Utc::now(),
                payload: payload.into(),
            });
            while data.msgs.len() as u64 > data.cfg.max_msgs {
                data.msgs.pop_front();
            }
            seq
        };
        state.publishes.notify_waiters();
        Ok(PubAck { sequence: seq })
    }

    async fn subscribe(&self, stream: &str, durable: &str) -> Result<Box<dyn Subscription>> {
        let state = self.stream(stream)?;
        state
            .data
            .lock()
            .consumers
            .entry(durable.to_owned())
            .or_insert(1);
        Ok(Box::new(MemorySubscription {
            stream_name: stream.to_owned(),
            durable: durable.to_owned(),
            state,
            inflight: None,
        }))
    }

    async fn first_sequence(&self, stream: &str) -> Result<u64> {
        let state = self.stream(stream)?;
        let data = state.data.lock();
        Ok(data.msgs.front().map(|m| m.seq).unwrap_or(data.next_seq))
    }

    async fn kv_bucket(&self, bucket: &str) -> Result<Arc<dyn KvBucket>> {
        let mut buckets = self.buckets.lock();
        let kv = buckets
            .entry(bucket.to_owned())
            .or_insert_with(|| Arc::new(MemoryKv::default()))
            .clone();
        Ok(kv)
    }
}

struct Inflight {
    seq: u64,
    attempts: u64,
    /// Earliest instant of the next redelivery; None when due immediately.
    due: Option<Instant>,
}

struct MemorySubscription {
    stream_name: String,
    durable: String,
    state: Arc<StreamState>,
    inflight: Option<Inflight>,
}

enum Step {
    Ready(Message),
    SleepUntil(Instant),
    WaitForPublish,
}

impl MemorySubscription {
    fn step(&mut self) -> Step {
        if let Some(inf) = &self.inflight {
            if let Some(due) = inf.due {
                if due > Instant::now() {
                    return Step::SleepUntil(due);
                }
            }
        }
        let data = self.state.data.lock();
        let last_seq = data.next_seq.saturating_sub(1);
        if let Some(inf) = &mut self.inflight {
            // Redeliver the in-flight message, unless retention dropped it.
            match data.msgs.iter().find(|m| m.seq == inf.seq) {
                Some(m) => {
                    let msg = build_message(&self.stream_name, m, inf.attempts, last_seq);
                    inf.due = None;
                    return Step::Ready(msg);
                }
                None => self.inflight = None,
            }
        }
        let cursor = *data.consumers.get(&self.durable).unwrap_or(&1);
        match data.msgs.iter().find(|m| m.seq >= cursor) {
            Some(m) => {
                self.inflight = Some(Inflight {
                    seq: m.seq,
                    attempts: 1,
                    due: None,
                });
                Step::Ready(build_message(&self.stream_name, m, 1, last_seq))
            }
            None => Step::WaitForPublish,
        }
    }
}

fn build_message(stream: &str, m: &StoredMsg, attempts: u64, last_seq: u64) -> Message {
    Message {
        payload: m.payload.to_vec(),
        meta: MessageMeta {
            stream: stream.to_owned(),
            sequence: m.seq,
            timestamp: m.timestamp,
            num_pending: last_seq.saturating_sub(m.seq),
            num_delivered: attempts,
        },
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Message> {
        loop {
            match self.step() {
                Step::Ready(msg) => return Ok(msg),
                Step::SleepUntil(due) => tokio::time::sleep_until(due.into()).await,
                Step::WaitForPublish => {
                    let state = self.state.clone();
                    let notified = state.publishes.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // Re-check: a publish may have raced the registration.
                    match self.step() {
                        Step::Ready(msg) => return Ok(msg),
                        Step::SleepUntil(due) => tokio::time::sleep_until(due.into()).await,
                        Step::WaitForPublish => notified.await,
                    }
                }
            }
        }
    }

    async fn ack(&mut self) -> Result<()> {
        let inf = self
            .inflight
            .take()
            .ok_or(Error::State("ack with no in-flight message"))?;
        self.state
            .data
            .lock()
            .consumers
            .insert(self.durable.clone(), inf.seq + 1);
        Ok(())
    }

    async fn nak(&mut self, delay: Duration) -> Result<()> {
        let inf = self
            .inflight
            .as_mut()
            .ok_or(Error::State("nak with no in-flight message"))?;
        inf.attempts += 1;
        inf.due = Some(Instant::now() + delay);
        Ok(())
    }
}

struct KvSlot {
    value: Vec<u8>,
    revision: u64,
    expires_at: Option<Instant>,
}

impl KvSlot {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Default)]
struct MemoryKv {
    entries: Mutex<(u64, HashMap<String, KvSlot>)>,
}

impl MemoryKv {
    fn insert(
        entries: &mut (u64, HashMap<String, KvSlot>),
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> u64 {
        entries.0 += 1;
        let revision = entries.0;
        entries.1.insert(
            key.to_owned(),
            KvSlot {
                value,
                revision,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        revision
    }
}

#[async_trait]
impl KvBucket for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let mut entries = self.entries.lock();
        if entries.1.get(key).is_some_and(KvSlot::expired) {
            entries.1.remove(key);
        }
        Ok(entries.1.get(key).map(|slot| KvEntry {
            value: slot.value.clone(),
            revision: slot.revision,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64> {
        let mut entries = self.entries.lock();
        Ok(Self::insert(&mut entries, key, value, ttl))
    }

    async fn create(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64> {
        let mut entries = self.entries.lock();
        if entries.1.get(key).is_some_and(|s| !s.expired()) {
            return Err(Error::Broker(format!("key {key} already exists")));
        }
        Ok(Self::insert(&mut entries, key, value, ttl))
    }

    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        revision: u64,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let mut entries = self.entries.lock();
        match entries.1.get(key) {
            Some(slot) if !slot.expired() && slot.revision == revision => {
                Ok(Self::insert(&mut entries, key, value, ttl))
            }
            _ => Err(Error::Broker(format!("revision mismatch on key {key}"))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        entries.1.retain(|_, slot| !slot.expired());
        let mut keys: Vec<String> = entries.1.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

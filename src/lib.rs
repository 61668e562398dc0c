//! Leaderless, eventually consistent replication sidecar for SQLite.
//!
//! Row changes are captured by triggers into sidecar log tables, published
//! onto sharded durable streams, and applied on every peer with per-key
//! ordering and last-arrival-wins conflicts. Snapshots cover nodes that
//! fall behind the log's retained window.

pub mod apply;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod health;
pub mod node;
pub mod registry;
pub mod replicator;
pub mod seqmap;
pub mod shard;
pub mod snapshot;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{CellValue, ChangeLogEvent, Envelope, OpType};
pub use node::Node;

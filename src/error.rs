use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the replication core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("watch: {0}")]
    Watch(#[from] notify::Error),
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("blocking task: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("broker: {0}")]
    Broker(String),
    #[error("schema hash mismatch, incoming {incoming}; apply paused")]
    SchemaMismatch { incoming: String, retry_after: Duration },
    #[error("stream gap on {stream}: next needed sequence {needed}, log starts at {first}")]
    StreamGap {
        stream: String,
        needed: u64,
        first: u64,
    },
    #[error("snapshot already in progress")]
    SnapshotPending,
    #[error("no snapshot present in the store")]
    NoSnapshot,
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),
    #[error("invalid state: {0}")]
    State(&'static str),
}

impl Error {
    /// True for conditions the subscriber must surface by terminating the
    /// whole process rather than retrying the message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StreamGap { .. })
    }
}

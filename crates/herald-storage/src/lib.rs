// Time-bounded message retention for `since` replay.
//
// Backends implement `MessageCache`; the broker only ever talks to the trait,
// so the durability layout of a backend is invisible to dispatch.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{Message, Since};
use std::sync::Arc;
use std::time::Duration;

pub mod file;
pub mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait MessageCache: std::fmt::Debug + Send + Sync {
    /// Retain a message for its topic. Control events are skipped.
    async fn store(&self, message: &Message) -> Result<()>;

    /// Retained messages for `topic` matching `since`, oldest first.
    /// Callers resolve [`Since::Ago`] first; an unresolved one is treated as
    /// [`Since::All`].
    async fn since(&self, topic: &str, since: Since) -> Result<Vec<Arc<Message>>>;

    /// Drop every message with `now - time >= retention`. Returns the number
    /// removed. A no-op when retention is unbounded.
    async fn prune(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn count(&self, topic: &str) -> Result<usize>;

    async fn total(&self) -> Result<usize>;

    async fn topics(&self) -> Result<Vec<String>>;

    /// `None` means messages are never pruned.
    fn retention(&self) -> Option<Duration>;
}

impl From<MemoryCache> for Arc<dyn MessageCache> {
    fn from(value: MemoryCache) -> Self {
        Arc::new(value)
    }
}

impl From<FileCache> for Arc<dyn MessageCache> {
    fn from(value: FileCache) -> Self {
        Arc::new(value)
    }
}

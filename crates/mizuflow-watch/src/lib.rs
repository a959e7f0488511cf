// Contract for the watched consistent store.
//
// The system-of-record is projected into a strongly-consistent KV store that
// assigns a global, monotone modify-revision to every mutation and can serve
// an ordered prefix watch from a past revision. This crate defines that
// contract, ships an in-memory backend for development and tests, and builds
// the version-guarded CAS projection on top of it.
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod projection;

pub use memory::MemoryWatchedStore;
pub use projection::save_if_newer;

pub type Result<T> = std::result::Result<T, WatchError>;

#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("cas conflict at {key} (expected mod revision {expected})")]
    Conflict { key: String, expected: i64 },
    #[error("watch history compacted (oldest available {oldest}, requested {requested})")]
    Compacted { oldest: i64, requested: i64 },
    #[error("cas retries exhausted for {0}")]
    Exhausted(String),
    #[error("lock on {0} held elsewhere")]
    LockBusy(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid payload at {key}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A stored key-value pair with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision at which the key was created.
    pub create_revision: i64,
    /// Revision of the last write to the key.
    pub mod_revision: i64,
}

/// Result of a prefix read: the pairs plus the store's revision at read time.
/// Watching from `revision + 1` observes exactly the mutations after the read.
#[derive(Debug, Clone)]
pub struct PrefixSnapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// One ordered mutation observed by a watch. Deletes carry no value; the
/// identity must be recovered from the key path.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, mod_revision: i64 },
}

impl WatchEvent {
    pub fn mod_revision(&self) -> i64 {
        match self {
            WatchEvent::Put(kv) => kv.mod_revision,
            WatchEvent::Delete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// Ordered stream of watch events. `next` returning `None` means the watch
/// was canceled by the store (shutdown, or the watcher fell too far behind);
/// the consumer is expected to resnapshot and re-watch.
#[derive(Debug)]
pub struct WatchStream {
    rx: tokio::sync::mpsc::Receiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: tokio::sync::mpsc::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// A held distributed lock. Dropping the handle without calling `release`
/// leaves the lease to expire on its own TTL.
#[async_trait]
pub trait LockHandle: Send {
    async fn release(self: Box<Self>);
}

impl std::fmt::Debug for dyn LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockHandle")
    }
}

/// Strongly-consistent KV store with prefix watch and leases.
///
/// Revisions are global and strictly increasing across all mutations. The
/// in-memory backend in this crate implements the full contract; a
/// production deployment points this trait at an external store with the
/// same semantics.
#[async_trait]
pub trait WatchedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot>;

    /// Unconditional upsert. Returns the assigned mod-revision.
    async fn put(&self, key: &str, value: String) -> Result<i64>;

    /// Conditional write. `expected_mod_revision == 0` requires the key to
    /// be absent (create); otherwise the key's current mod-revision must
    /// match. Returns the assigned mod-revision or `Conflict`.
    async fn compare_and_put(
        &self,
        key: &str,
        value: String,
        expected_mod_revision: i64,
    ) -> Result<i64>;

    /// Removes a key. Returns the deletion revision, or `None` if the key
    /// was absent (no revision is consumed).
    async fn delete(&self, key: &str) -> Result<Option<i64>>;

    /// Opens an ordered watch over `prefix` starting at `start_revision`
    /// (inclusive). `start_revision <= 0` means "live events only". Fails
    /// with `Compacted` when the requested history is no longer retained.
    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;

    /// Acquires an ephemeral lease-backed lock, waiting up to `deadline`.
    /// `LockBusy` after the deadline means another holder has it.
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Duration,
    ) -> Result<Box<dyn LockHandle>>;

    async fn health(&self) -> Result<()>;
}

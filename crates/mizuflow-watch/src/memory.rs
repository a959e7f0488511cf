// In-memory implementation of the watched-store contract.
//
// Exists for local development and tests: one process, no durability, but
// the full semantics — global monotone revisions, CAS on mod-revision,
// ordered prefix watch replayable from a bounded history window, and
// TTL-expiring locks. Consumers that fall behind the history window get the
// same `Compacted` answer a real deployment would give them.
use crate::{
    KeyValue, LockHandle, PrefixSnapshot, Result, WatchError, WatchEvent, WatchStream, WatchedStore,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

const DEFAULT_HISTORY_CAPACITY: usize = 4096;
const DEFAULT_WATCH_BUFFER: usize = 1024;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    create_revision: i64,
    mod_revision: i64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchEvent>,
}

struct HistoryEntry {
    revision: i64,
    event: WatchEvent,
}

#[derive(Default)]
struct State {
    kvs: BTreeMap<String, StoredValue>,
    revision: i64,
    history: VecDeque<HistoryEntry>,
    watchers: Vec<Watcher>,
}

#[derive(Debug, Clone, Copy)]
struct LockState {
    holder: u64,
    expires_at: Instant,
}

/// Single-process watched store. Cloneable; clones share state.
#[derive(Clone)]
pub struct MemoryWatchedStore {
    state: Arc<Mutex<State>>,
    locks: Arc<Mutex<HashMap<String, LockState>>>,
    next_holder: Arc<std::sync::atomic::AtomicU64>,
    history_capacity: usize,
    watch_buffer: usize,
}

impl Default for MemoryWatchedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWatchedStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            next_holder: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    /// Applies one mutation under the state lock: assigns the next revision,
    /// records it in the history window, and fans it out to watchers. A
    /// watcher whose channel is full is dropped; its stream ends and the
    /// consumer resnapshots.
    fn commit(&self, state: &mut State, event_for: impl FnOnce(i64) -> WatchEvent) -> i64 {
        state.revision += 1;
        let revision = state.revision;
        let event = event_for(revision);

        state.history.push_back(HistoryEntry {
            revision,
            event: event.clone(),
        });
        while state.history.len() > self.history_capacity {
            state.history.pop_front();
        }

        state.watchers.retain(|watcher| {
            if !event_key(&event).starts_with(&watcher.prefix) {
                return true;
            }
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(prefix = %watcher.prefix, "dropping lagging watcher");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        revision
    }
}

fn event_key(event: &WatchEvent) -> &str {
    match event {
        WatchEvent::Put(kv) => &kv.key,
        WatchEvent::Delete { key, .. } => key,
    }
}

#[async_trait]
impl WatchedStore for MemoryWatchedStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.state.lock().await;
        Ok(state.kvs.get(key).map(|stored| KeyValue {
            key: key.to_string(),
            value: stored.value.clone(),
            create_revision: stored.create_revision,
            mod_revision: stored.mod_revision,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
        let state = self.state.lock().await;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| KeyValue {
                key: key.clone(),
                value: stored.value.clone(),
                create_revision: stored.create_revision,
                mod_revision: stored.mod_revision,
            })
            .collect();
        Ok(PrefixSnapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: String) -> Result<i64> {
        let mut state = self.state.lock().await;
        let create_revision = state.kvs.get(key).map(|s| s.create_revision);
        let revision = self.commit(&mut state, |revision| {
            WatchEvent::Put(KeyValue {
                key: key.to_string(),
                value: value.clone(),
                create_revision: create_revision.unwrap_or(revision),
                mod_revision: revision,
            })
        });
        state.kvs.insert(
            key.to_string(),
            StoredValue {
                value,
                create_revision: create_revision.unwrap_or(revision),
                mod_revision: revision,
            },
        );
        Ok(revision)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        value: String,
        expected_mod_revision: i64,
    ) -> Result<i64> {
        let mut state = self.state.lock().await;
        let current = state.kvs.get(key).map(|s| s.mod_revision);
        let matches = match (current, expected_mod_revision) {
            // Create: the key must not exist yet.
            (None, 0) => true,
            (Some(_), 0) => false,
            (None, _) => false,
            (Some(actual), expected) => actual == expected,
        };
        if !matches {
            return Err(WatchError::Conflict {
                key: key.to_string(),
                expected: expected_mod_revision,
            });
        }
        let create_revision = state.kvs.get(key).map(|s| s.create_revision);
        let revision = self.commit(&mut state, |revision| {
            WatchEvent::Put(KeyValue {
                key: key.to_string(),
                value: value.clone(),
                create_revision: create_revision.unwrap_or(revision),
                mod_revision: revision,
            })
        });
        state.kvs.insert(
            key.to_string(),
            StoredValue {
                value,
                create_revision: create_revision.unwrap_or(revision),
                mod_revision: revision,
            },
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        if state.kvs.remove(key).is_none() {
            return Ok(None);
        }
        let revision = self.commit(&mut state, |revision| WatchEvent::Delete {
            key: key.to_string(),
            mod_revision: revision,
        });
        Ok(Some(revision))
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut state = self.state.lock().await;

        let replay: Vec<WatchEvent> = if start_revision > 0 {
            let oldest_available = state
                .history
                .front()
                .map(|entry| entry.revision)
                .unwrap_or(state.revision + 1);
            if start_revision < oldest_available {
                return Err(WatchError::Compacted {
                    oldest: oldest_available,
                    requested: start_revision,
                });
            }
            state
                .history
                .iter()
                .filter(|entry| {
                    entry.revision >= start_revision && event_key(&entry.event).starts_with(prefix)
                })
                .map(|entry| entry.event.clone())
                .collect()
        } else {
            Vec::new()
        };

        let (tx, rx) = mpsc::channel(self.watch_buffer + replay.len());
        for event in replay {
            // Capacity accounts for the replayed prefix, so this cannot fail.
            let _ = tx.try_send(event);
        }
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Duration,
    ) -> Result<Box<dyn LockHandle>> {
        let holder = self
            .next_holder
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let started = Instant::now();
        loop {
            {
                let mut locks = self.locks.lock().await;
                let now = Instant::now();
                let free = match locks.get(key) {
                    None => true,
                    Some(existing) => existing.expires_at <= now,
                };
                if free {
                    locks.insert(
                        key.to_string(),
                        LockState {
                            holder,
                            expires_at: now + ttl,
                        },
                    );
                    return Ok(Box::new(MemoryLockHandle {
                        locks: Arc::clone(&self.locks),
                        key: key.to_string(),
                        holder,
                    }));
                }
            }
            if started.elapsed() >= deadline {
                return Err(WatchError::LockBusy(key.to_string()));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryLockHandle {
    locks: Arc<Mutex<HashMap<String, LockState>>>,
    key: String,
    holder: u64,
}

#[async_trait]
impl LockHandle for MemoryLockHandle {
    async fn release(self: Box<Self>) {
        let mut locks = self.locks.lock().await;
        if let Some(state) = locks.get(&self.key) {
            if state.holder == self.holder {
                locks.remove(&self.key);
            }
        }
    }
}

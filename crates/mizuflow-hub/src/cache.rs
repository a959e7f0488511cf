// In-memory view of the watched store: latest flag per identity plus the
// highest revision observed so far. Serves the snapshot endpoint and the
// dashboard without touching a backing store.
use mizuflow_wire::{FeatureFlag, FlagKey};
use std::collections::HashMap;
use std::sync::RwLock;

/// Latest flag per identity with a monotone global revision.
///
/// Writers are the ingestor (snapshot bootstrap and watch events); readers
/// are stream and snapshot handlers. The cache never regresses: updates and
/// deletes carrying a revision at or below what is already recorded for an
/// identity are ignored, which makes replay after reconnect idempotent.
#[derive(Debug, Default)]
pub struct FeatureCache {
    inner: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    flags: HashMap<FlagKey, FeatureFlag>,
    global_revision: i64,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a put. Stale revisions for the identity are dropped; the
    /// global revision only ever moves forward.
    pub fn update(&self, flag: FeatureFlag) {
        let mut state = self.inner.write().expect("cache lock");
        state.global_revision = state.global_revision.max(flag.revision);
        let key = flag.flag_key();
        if let Some(existing) = state.flags.get(&key) {
            if flag.revision <= existing.revision {
                return;
            }
        }
        state.flags.insert(key, flag);
    }

    /// Applies a delete observed at `revision`. A stale delete (replay
    /// overlap) leaves the entry alone.
    pub fn delete(&self, key: &FlagKey, revision: i64) {
        let mut state = self.inner.write().expect("cache lock");
        state.global_revision = state.global_revision.max(revision);
        if let Some(existing) = state.flags.get(key) {
            if revision > existing.revision {
                state.flags.remove(key);
            }
        }
    }

    /// Full copy of the current flags plus the global revision, for the
    /// snapshot endpoint.
    pub fn snapshot(&self) -> (Vec<FeatureFlag>, i64) {
        let state = self.inner.read().expect("cache lock");
        (state.flags.values().cloned().collect(), state.global_revision)
    }

    pub fn get(&self, key: &FlagKey) -> Option<FeatureFlag> {
        self.inner.read().expect("cache lock").flags.get(key).cloned()
    }

    pub fn global_revision(&self) -> i64 {
        self.inner.read().expect("cache lock").global_revision
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock").flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

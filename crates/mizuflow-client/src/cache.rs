// Client-local flag cache with disk persistence.
//
// The cache is the SDK's read path: every evaluation is served from memory.
// It is advanced by snapshot seeds and stream events, dedupes on revision,
// and is periodically flushed to a snapshot file so a restarting process can
// serve stale-but-useful values when the server is unreachable.
use anyhow::{Context, Result};
use mizuflow_wire::{Action, EventMessage, FeatureFlag};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// On-disk snapshot shape: `{"features": {key: FeatureFlag}, "revision": N}`.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    features: HashMap<String, FeatureFlag>,
    revision: i64,
}

#[derive(Debug, Default)]
struct CacheState {
    features: HashMap<String, FeatureFlag>,
    last_rev: i64,
    dirty: bool,
}

#[derive(Debug, Default)]
pub(crate) struct LocalCache {
    inner: RwLock<CacheState>,
}

impl LocalCache {
    /// Replaces the whole cache with a server snapshot. Used on start and
    /// after a `reset`, where the server has told us to discard local state.
    pub(crate) fn seed(&self, flags: Vec<FeatureFlag>, revision: i64) {
        let mut state = self.inner.write().expect("cache lock");
        state.features = flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect();
        state.last_rev = revision;
        state.dirty = true;
    }

    /// Applies one stream event. Returns false when the event is stale
    /// (revision at or below what we already hold) and was discarded.
    pub(crate) fn apply(&self, msg: &EventMessage) -> bool {
        let mut state = self.inner.write().expect("cache lock");
        if msg.revision <= state.last_rev {
            tracing::debug!(rev = msg.revision, last_rev = state.last_rev, "stale event discarded");
            return false;
        }
        match msg.action {
            Action::Delete => {
                state.features.remove(&msg.key);
            }
            Action::Put => {
                state.features.insert(
                    msg.key.clone(),
                    FeatureFlag {
                        namespace: msg.namespace.clone(),
                        env: msg.env.clone(),
                        key: msg.key.clone(),
                        value: msg.value.clone(),
                        flag_type: msg.flag_type,
                        version: msg.version,
                        revision: msg.revision,
                    },
                );
            }
        }
        state.last_rev = msg.revision;
        state.dirty = true;
        true
    }

    pub(crate) fn get(&self, key: &str) -> Option<FeatureFlag> {
        self.inner.read().expect("cache lock").features.get(key).cloned()
    }

    pub(crate) fn last_rev(&self) -> i64 {
        self.inner.read().expect("cache lock").last_rev
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().expect("cache lock").features.len()
    }

    /// Persists the cache if it changed since the last flush. The dirty bit
    /// is cleared first so a write error re-marks rather than loops hot.
    pub(crate) fn persist_if_dirty(&self, path: &Path) -> Result<bool> {
        let snapshot = {
            let mut state = self.inner.write().expect("cache lock");
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            CacheFile {
                features: state.features.clone(),
                revision: state.last_rev,
            }
        };
        if let Err(err) = write_atomically(path, &snapshot) {
            self.inner.write().expect("cache lock").dirty = true;
            return Err(err);
        }
        Ok(true)
    }

    /// Loads the cache from a snapshot file written by `persist_if_dirty`.
    pub(crate) fn load(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read(path)
            .with_context(|| format!("read cache file {}", path.display()))?;
        let file: CacheFile = serde_json::from_slice(&raw)
            .with_context(|| format!("parse cache file {}", path.display()))?;
        let mut state = self.inner.write().expect("cache lock");
        state.features = file.features;
        state.last_rev = file.revision;
        state.dirty = false;
        Ok(())
    }
}

// Write to `<path>.tmp`, then rename onto `path`. Readers either see the old
// snapshot or the new one, never a torn write.
fn write_atomically(path: &Path, snapshot: &CacheFile) -> Result<()> {
    let bytes = serde_json::to_vec(snapshot).context("serialize cache snapshot")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mizuflow_wire::FlagType;

    fn put(key: &str, value: &str, revision: i64) -> EventMessage {
        EventMessage {
            namespace: "default".to_string(),
            env: "dev".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            flag_type: FlagType::String,
            version: 1,
            revision,
            action: Action::Put,
        }
    }

    #[test]
    fn apply_advances_revision_and_upserts() {
        let cache = LocalCache::default();
        assert!(cache.apply(&put("a", "1", 5)));
        assert_eq!(cache.last_rev(), 5);
        assert_eq!(cache.get("a").expect("flag").value, "1");
    }

    #[test]
    fn stale_events_are_discarded() {
        let cache = LocalCache::default();
        cache.apply(&put("a", "new", 10));
        assert!(!cache.apply(&put("a", "old", 10)));
        assert!(!cache.apply(&put("a", "older", 3)));
        assert_eq!(cache.get("a").expect("flag").value, "new");
        assert_eq!(cache.last_rev(), 10);
    }

    #[test]
    fn delete_removes_entry() {
        let cache = LocalCache::default();
        cache.apply(&put("a", "1", 5));
        let mut delete = put("a", "", 6);
        delete.action = Action::Delete;
        assert!(cache.apply(&delete));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.last_rev(), 6);
    }

    #[test]
    fn seed_replaces_previous_contents() {
        let cache = LocalCache::default();
        cache.apply(&put("gone", "1", 2));
        cache.seed(
            vec![FeatureFlag {
                namespace: "default".to_string(),
                env: "dev".to_string(),
                key: "kept".to_string(),
                value: "v".to_string(),
                flag_type: FlagType::String,
                version: 1,
                revision: 9,
            }],
            9,
        );
        assert!(cache.get("gone").is_none());
        assert!(cache.get("kept").is_some());
        assert_eq!(cache.last_rev(), 9);
    }

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");

        let cache = LocalCache::default();
        cache.apply(&put("a", "1", 7));
        assert!(cache.persist_if_dirty(&path).expect("persist"));
        // Nothing changed since the flush.
        assert!(!cache.persist_if_dirty(&path).expect("persist"));

        let restored = LocalCache::default();
        restored.load(&path).expect("load");
        assert_eq!(restored.last_rev(), 7);
        assert_eq!(restored.get("a").expect("flag").value, "1");
    }

    #[test]
    fn load_of_missing_file_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::default();
        assert!(cache.load(&dir.path().join("absent.json")).is_err());
    }
}

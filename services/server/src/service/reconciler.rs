// Periodic repair of divergence between the system-of-record and the
// watched store.
//
// Runs under a lease-backed lock so only one replica sweeps at a time. The
// sweep is fail-safe in one direction only: a system-of-record read error
// aborts the round (never overwrite the watched store with nothing), while
// orphan keys in the watched store are logged and left for an operator.
use crate::store::FlagStore;
use mizuflow_watch::{save_if_newer, WatchError, WatchedStore};
use mizuflow_wire::{feature_key, FeatureFlag, FEATURE_ROOT_PREFIX};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const RECONCILER_LOCK_KEY: &str = "/locks/reconciler";
const LOCK_TTL: Duration = Duration::from_secs(10);
const LOCK_DEADLINE: Duration = Duration::from_secs(5);

pub struct Reconciler {
    store: Arc<dyn FlagStore>,
    watched: Arc<dyn WatchedStore>,
    interval: Duration,
    batch_size: i64,
    batch_delay: Option<Duration>,
    lock_deadline: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn FlagStore>,
        watched: Arc<dyn WatchedStore>,
        interval: Duration,
        batch_size: i64,
        batch_delay: Option<Duration>,
    ) -> Self {
        Self {
            store,
            watched,
            interval,
            batch_size: batch_size.max(1),
            batch_delay,
            lock_deadline: LOCK_DEADLINE,
        }
    }

    pub fn with_lock_deadline(mut self, deadline: Duration) -> Self {
        self.lock_deadline = deadline;
        self
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // The immediate first tick would race the ingestor's startup; skip it.
        ticker.tick().await;
        tracing::info!(interval = ?self.interval, "reconciler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => self.run_once().await,
            }
        }
    }

    /// One guarded round: acquire the lock (skip the round if another
    /// replica holds it), sweep, release.
    pub async fn run_once(&self) {
        let guard = match self
            .watched
            .acquire_lock(RECONCILER_LOCK_KEY, LOCK_TTL, self.lock_deadline)
            .await
        {
            Ok(guard) => guard,
            Err(WatchError::LockBusy(_)) => {
                tracing::debug!("reconciliation skipped, another instance holds the lock");
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to acquire reconciliation lock");
                return;
            }
        };

        tracing::info!("lock acquired, starting reconciliation");
        self.reconcile().await;
        guard.release().await;
    }

    async fn reconcile(&self) {
        let mut after_id = 0;
        let mut checked = 0usize;
        let mut repaired = 0usize;
        let mut known_keys: HashSet<String> = HashSet::new();

        loop {
            let rows = match self.store.page_features(after_id, self.batch_size).await {
                Ok(rows) => rows,
                Err(err) => {
                    // Fail-safe: with no authoritative rows to compare
                    // against, touching the watched store risks destroying
                    // good state.
                    tracing::error!(error = %err, "recon: system-of-record read failed, aborting round");
                    return;
                }
            };
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                checked += 1;
                let full_key = feature_key(&row.env, &row.namespace, &row.key);
                known_keys.insert(full_key.clone());

                let needs_repair = match self.watched.get(&full_key).await {
                    Ok(None) => Some("missing_in_watched_store"),
                    Ok(Some(kv)) => match serde_json::from_str::<FeatureFlag>(&kv.value) {
                        Ok(stored) if stored.version < row.version => Some("stale_version"),
                        Ok(_) => None,
                        Err(_) => Some("undecodable_value"),
                    },
                    Err(err) => {
                        tracing::warn!(key = %full_key, error = %err, "recon: watched store read failed");
                        None
                    }
                };

                if let Some(reason) = needs_repair {
                    tracing::warn!(key = %full_key, reason, "recon: fixing inconsistency");
                    match save_if_newer(self.watched.as_ref(), &full_key, &row.to_flag()).await {
                        Ok(_) => {
                            repaired += 1;
                            metrics::counter!("mizuflow_reconciler_repairs_total").increment(1);
                        }
                        Err(err) => {
                            tracing::error!(key = %full_key, error = %err, "recon: repair failed");
                        }
                    }
                }
            }

            after_id = rows.last().map(|row| row.id).unwrap_or(after_id);
            if let Some(delay) = self.batch_delay {
                tokio::time::sleep(delay).await;
            }
        }

        // Orphans: present in the watched store, absent in the
        // system-of-record. Log-only; deletion is an operator decision.
        match self.watched.get_prefix(FEATURE_ROOT_PREFIX).await {
            Ok(snapshot) => {
                for kv in &snapshot.kvs {
                    if !known_keys.contains(&kv.key) {
                        tracing::warn!(key = %kv.key, "recon: orphan key in watched store");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "recon: orphan scan skipped");
            }
        }

        tracing::info!(checked, repaired, "reconciliation finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryFlagStore;
    use crate::store::FeatureWrite;
    use mizuflow_watch::MemoryWatchedStore;
    use mizuflow_wire::FlagType;

    fn write(key: &str, value: &str) -> FeatureWrite {
        FeatureWrite {
            namespace: "default".to_string(),
            env: "dev".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            flag_type: FlagType::String,
            operator: "tester".to_string(),
            trace_id: "trace".to_string(),
        }
    }

    fn reconciler(
        store: Arc<MemoryFlagStore>,
        watched: Arc<MemoryWatchedStore>,
    ) -> Reconciler {
        Reconciler::new(store, watched, Duration::from_secs(60), 2, None)
    }

    #[tokio::test]
    async fn repairs_rows_missing_from_watched_store() {
        let store = Arc::new(MemoryFlagStore::new());
        let watched = Arc::new(MemoryWatchedStore::new());
        for i in 0..5 {
            store
                .save_feature(write(&format!("k{i}"), "v"))
                .await
                .expect("save");
        }

        reconciler(Arc::clone(&store), Arc::clone(&watched))
            .run_once()
            .await;

        let snapshot = watched.get_prefix(FEATURE_ROOT_PREFIX).await.expect("prefix");
        assert_eq!(snapshot.kvs.len(), 5);
    }

    #[tokio::test]
    async fn repairs_stale_versions_but_leaves_fresh_ones() {
        let store = Arc::new(MemoryFlagStore::new());
        let watched = Arc::new(MemoryWatchedStore::new());
        store.save_feature(write("stale", "old")).await.expect("save");
        let outcome = store.save_feature(write("stale", "new")).await.expect("save");

        // Project only version 1 so the watched store is behind.
        let mut v1 = outcome.flag.clone();
        v1.version = 1;
        v1.value = "old".to_string();
        save_if_newer(
            watched.as_ref(),
            &feature_key("dev", "default", "stale"),
            &v1,
        )
        .await
        .expect("project v1");

        store.save_feature(write("fresh", "x")).await.expect("save");
        let fresh_outcome = store
            .get_feature(&mizuflow_wire::FlagKey::new("default", "dev", "fresh"))
            .await
            .expect("get")
            .expect("row");
        save_if_newer(
            watched.as_ref(),
            &feature_key("dev", "default", "fresh"),
            &fresh_outcome.to_flag(),
        )
        .await
        .expect("project fresh");
        let fresh_before = watched
            .get(&feature_key("dev", "default", "fresh"))
            .await
            .expect("get")
            .expect("present");

        reconciler(Arc::clone(&store), Arc::clone(&watched))
            .run_once()
            .await;

        let repaired = watched
            .get(&feature_key("dev", "default", "stale"))
            .await
            .expect("get")
            .expect("present");
        let flag: FeatureFlag = serde_json::from_str(&repaired.value).expect("payload");
        assert_eq!(flag.version, 2);
        assert_eq!(flag.value, "new");

        // The up-to-date row was not rewritten.
        let fresh_after = watched
            .get(&feature_key("dev", "default", "fresh"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fresh_after.mod_revision, fresh_before.mod_revision);
    }

    #[tokio::test]
    async fn orphans_are_left_in_place() {
        let store = Arc::new(MemoryFlagStore::new());
        let watched = Arc::new(MemoryWatchedStore::new());
        watched
            .put(
                &feature_key("dev", "default", "orphan"),
                "{\"namespace\":\"default\",\"env\":\"dev\",\"key\":\"orphan\",\"value\":\"x\",\"type\":\"string\",\"version\":1}".to_string(),
            )
            .await
            .expect("put");

        reconciler(Arc::clone(&store), Arc::clone(&watched))
            .run_once()
            .await;

        // Log-only policy: the orphan survives the sweep.
        assert!(watched
            .get(&feature_key("dev", "default", "orphan"))
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn round_is_skipped_while_lock_is_held() {
        let store = Arc::new(MemoryFlagStore::new());
        let watched = Arc::new(MemoryWatchedStore::new());
        store.save_feature(write("k", "v")).await.expect("save");

        let _guard = watched
            .acquire_lock(RECONCILER_LOCK_KEY, Duration::from_secs(30), Duration::from_millis(10))
            .await
            .expect("hold lock");

        let recon = Reconciler::new(
            Arc::clone(&store) as Arc<dyn FlagStore>,
            Arc::clone(&watched) as Arc<dyn WatchedStore>,
            Duration::from_secs(60),
            10,
            None,
        )
        .with_lock_deadline(Duration::from_millis(100));
        recon.run_once().await;

        let snapshot = watched.get_prefix(FEATURE_ROOT_PREFIX).await.expect("prefix");
        assert!(snapshot.kvs.is_empty());
    }
}

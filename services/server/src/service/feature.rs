// Write path and read surface for flags.
//
// `save_feature` is the only rollback point in the system: master, audit,
// and outbox commit together inside the store. Projection to the watched
// store is asynchronous — an opportunistic push right after commit for
// latency, with the outbox worker as the at-least-once safety net.
use crate::store::{
    AuditRow, FeatureFilter, FeatureRow, FeatureWrite, FlagStore, OutboxStatus, StoreError,
};
use mizuflow_hub::{FeatureCache, Hub, RevisionRing};
use mizuflow_watch::{save_if_newer, WatchedStore};
use mizuflow_wire::{feature_key, EventMessage, FeatureFlag, FlagKey};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("feature not found: {0}/{1}/{2}")]
    NotFound(String, String, String),
    #[error("audit {audit_id} belongs to {env}/{namespace}/{key}")]
    AuditMismatch {
        audit_id: i64,
        namespace: String,
        env: String,
        key: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Health of the two persistence dependencies, reported separately so an
/// operator can tell which side is down.
#[derive(Debug)]
pub struct HealthReport {
    pub store_ok: bool,
    pub watched_ok: bool,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.store_ok && self.watched_ok
    }
}

pub struct FeatureService {
    store: Arc<dyn FlagStore>,
    watched: Arc<dyn WatchedStore>,
    cache: Arc<FeatureCache>,
    ring: Arc<RevisionRing>,
    hub: Hub,
}

impl FeatureService {
    pub fn new(
        store: Arc<dyn FlagStore>,
        watched: Arc<dyn WatchedStore>,
        cache: Arc<FeatureCache>,
        ring: Arc<RevisionRing>,
        hub: Hub,
    ) -> Self {
        Self {
            store,
            watched,
            cache,
            ring,
            hub,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Commits the write, then fires an opportunistic projection. A failed
    /// projection is only logged; the outbox worker retries it.
    pub async fn save_feature(&self, write: FeatureWrite) -> Result<i64, FeatureError> {
        let outcome = self.store.save_feature(write).await?;
        metrics::counter!("mizuflow_feature_writes_total").increment(1);

        let store = Arc::clone(&self.store);
        let watched = Arc::clone(&self.watched);
        let flag = outcome.flag;
        let outbox_id = outcome.outbox_id;
        tokio::spawn(async move {
            let full_key = feature_key(&flag.env, &flag.namespace, &flag.key);
            match save_if_newer(watched.as_ref(), &full_key, &flag).await {
                Ok(revision) => {
                    tracing::debug!(key = %flag.key, rev = revision, "projected after commit");
                    if let Err(err) = store
                        .update_outbox_status(outbox_id, OutboxStatus::Completed, 0)
                        .await
                    {
                        tracing::warn!(id = outbox_id, error = %err, "failed to settle outbox task");
                    }
                }
                Err(err) => {
                    // The outbox worker owns the retry.
                    tracing::warn!(key = %flag.key, error = %err, "opportunistic projection failed");
                }
            }
        });

        Ok(outcome.version)
    }

    /// Rollback is a forward write: the referenced audit's old value becomes
    /// the new value, history stays intact, version still increases.
    pub async fn rollback_feature(
        &self,
        key: &FlagKey,
        audit_id: i64,
        operator: &str,
        trace_id: String,
    ) -> Result<i64, FeatureError> {
        let audit = self.store.get_audit(audit_id).await?;
        if audit.namespace != key.namespace || audit.env != key.env || audit.key != key.key {
            return Err(FeatureError::AuditMismatch {
                audit_id,
                namespace: audit.namespace,
                env: audit.env,
                key: audit.key,
            });
        }

        tracing::info!(
            key = %key.key,
            from_value = %audit.new_value,
            to_value = %audit.old_value,
            "rolling back feature"
        );

        self.save_feature(FeatureWrite {
            namespace: key.namespace.clone(),
            env: key.env.clone(),
            key: key.key.clone(),
            value: audit.old_value,
            flag_type: audit.flag_type,
            operator: operator.to_string(),
            trace_id,
        })
        .await
    }

    pub async fn get_feature(&self, key: &FlagKey) -> Result<FeatureRow, FeatureError> {
        self.store.get_feature(key).await?.ok_or_else(|| {
            FeatureError::NotFound(key.namespace.clone(), key.env.clone(), key.key.clone())
        })
    }

    pub async fn list_features(
        &self,
        filter: &FeatureFilter,
    ) -> Result<Vec<FeatureRow>, FeatureError> {
        Ok(self.store.list_features(filter).await?)
    }

    pub async fn list_audits(&self, key: &FlagKey) -> Result<Vec<AuditRow>, FeatureError> {
        Ok(self.store.list_audits(key).await?)
    }

    /// Replay tail for a resuming subscriber; `(_, false)` means the ring no
    /// longer covers `last_rev` and the subscriber must resync.
    pub fn compensation(&self, last_rev: i64) -> (Vec<EventMessage>, bool) {
        self.ring.get_since(last_rev)
    }

    /// Current cache contents plus global revision, for the snapshot
    /// endpoint.
    pub fn snapshot(&self) -> (Vec<FeatureFlag>, i64) {
        self.cache.snapshot()
    }

    pub async fn health(&self) -> HealthReport {
        let store_ok = match self.store.health_check().await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "system-of-record health check failed");
                false
            }
        };
        let watched_ok = match self.watched.health().await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "watched store health check failed");
                false
            }
        };
        HealthReport {
            store_ok,
            watched_ok,
        }
    }
}

// Watch ingestor: the single writer for cache, ring, and hub.
//
// Startup order matters: read the full prefix snapshot, remember the store
// revision it was taken at, then watch from the next revision. Nothing
// between snapshot and watch can be lost, and everything downstream (ring
// order, hub fan-out order, per-client revision monotonicity) inherits the
// watch order established here.
use anyhow::{Context, Result};
use mizuflow_hub::{FeatureCache, Hub, RevisionRing};
use mizuflow_watch::{WatchEvent, WatchedStore};
use mizuflow_wire::{parse_feature_key, EventMessage, FeatureFlag, FEATURE_ROOT_PREFIX};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Ingestor {
    watched: Arc<dyn WatchedStore>,
    cache: Arc<FeatureCache>,
    ring: Arc<RevisionRing>,
    hub: Hub,
}

impl Ingestor {
    pub fn new(
        watched: Arc<dyn WatchedStore>,
        cache: Arc<FeatureCache>,
        ring: Arc<RevisionRing>,
        hub: Hub,
    ) -> Self {
        Self {
            watched,
            cache,
            ring,
            hub,
        }
    }

    /// Runs one snapshot + watch session. Returns `Ok` both on shutdown and
    /// when the watch ends (compaction, store restart); the supervisor
    /// decides whether to start a new session.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let snapshot = self
            .watched
            .get_prefix(FEATURE_ROOT_PREFIX)
            .await
            .context("initial feature snapshot")?;
        for kv in &snapshot.kvs {
            match serde_json::from_str::<FeatureFlag>(&kv.value) {
                Ok(mut flag) => {
                    flag.revision = kv.mod_revision;
                    self.cache.update(flag);
                }
                Err(err) => {
                    tracing::warn!(key = %kv.key, error = %err, "skipping undecodable flag in snapshot");
                }
            }
        }
        tracing::info!(
            flags = snapshot.kvs.len(),
            rev = snapshot.revision,
            "feature snapshot initialized"
        );

        // Watch from the revision right after the snapshot so no event in
        // between is lost.
        let mut watch = self
            .watched
            .watch_prefix(FEATURE_ROOT_PREFIX, snapshot.revision + 1)
            .await
            .context("open feature watch")?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = watch.next() => {
                    let Some(event) = event else {
                        tracing::warn!("feature watch canceled");
                        return Ok(());
                    };
                    let Some(msg) = self.apply(event) else { continue };
                    self.ring.push(msg.clone());
                    if !self.hub.broadcast(msg).await {
                        // Hub gone means the process is shutting down.
                        return Ok(());
                    }
                }
            }
        }
    }

    // Applies one watch event to the cache and converts it to the message
    // that goes into the ring and out to subscribers.
    fn apply(&self, event: WatchEvent) -> Option<EventMessage> {
        match event {
            WatchEvent::Put(kv) => {
                let mut flag: FeatureFlag = match serde_json::from_str(&kv.value) {
                    Ok(flag) => flag,
                    Err(err) => {
                        tracing::error!(key = %kv.key, error = %err, "undecodable flag in watch event");
                        return None;
                    }
                };
                flag.revision = kv.mod_revision;
                let msg = EventMessage::put(&flag, kv.mod_revision);
                self.cache.update(flag);
                Some(msg)
            }
            WatchEvent::Delete { key, mod_revision } => {
                // Delete events carry no body; the identity lives in the key
                // path.
                let Some(identity) = parse_feature_key(&key) else {
                    tracing::warn!(key = %key, "delete event with unparsable key");
                    return None;
                };
                self.cache.delete(&identity, mod_revision);
                Some(EventMessage::delete(identity, mod_revision))
            }
        }
    }
}

/// Keeps the ingestor alive: a canceled watch (compaction, store hiccup)
/// ends a session, and a fresh session re-snapshots and re-watches after a
/// short delay.
pub async fn run_supervised(
    ingestor: Ingestor,
    shutdown: CancellationToken,
    restart_delay: Duration,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match ingestor.run(shutdown.clone()).await {
            Ok(()) => {
                if shutdown.is_cancelled() {
                    return;
                }
                tracing::warn!("ingestor session ended, restarting");
            }
            Err(err) => {
                tracing::error!(error = %err, "ingestor failed, restarting");
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

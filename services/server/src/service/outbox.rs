// Outbox worker: at-least-once projection of committed writes.
//
// Every committed write leaves a pending task behind. Most of the time the
// opportunistic post-commit push has already projected it and the worker
// just settles the task via the idempotent `save_if_newer`. When that push
// failed (watched store down, process crash between commit and push), this
// loop is what guarantees convergence.
use crate::store::{FlagStore, OutboxStatus};
use mizuflow_watch::{save_if_newer, WatchedStore};
use mizuflow_wire::{feature_key, FeatureFlag};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_RETRIES: i32 = 5;

pub struct OutboxWorker {
    store: Arc<dyn FlagStore>,
    watched: Arc<dyn WatchedStore>,
    interval: Duration,
    batch: i64,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn FlagStore>,
        watched: Arc<dyn WatchedStore>,
        interval: Duration,
        batch: i64,
    ) -> Self {
        Self {
            store,
            watched,
            interval,
            batch,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(interval = ?self.interval, "outbox worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("outbox worker stopped");
                    return;
                }
                _ = ticker.tick() => self.process_pending().await,
            }
        }
    }

    pub async fn process_pending(&self) {
        let tasks = match self.store.fetch_pending_outbox(self.batch).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(error = %err, "failed to fetch pending outbox tasks");
                return;
            }
        };

        for task in tasks {
            tracing::debug!(id = task.id, key = %task.key, "processing outbox task");

            let flag: FeatureFlag = match serde_json::from_str(&task.payload) {
                Ok(flag) => flag,
                Err(err) => {
                    // A corrupt payload will never deserialize; terminal-fail
                    // instead of burning retries.
                    tracing::error!(id = task.id, error = %err, "outbox payload undecodable");
                    metrics::counter!("mizuflow_outbox_failed_total").increment(1);
                    self.settle(task.id, OutboxStatus::Failed, task.retry_count)
                        .await;
                    continue;
                }
            };

            let full_key = feature_key(&flag.env, &flag.namespace, &flag.key);
            match save_if_newer(self.watched.as_ref(), &full_key, &flag).await {
                Ok(_) => {
                    metrics::counter!("mizuflow_outbox_completed_total").increment(1);
                    self.settle(task.id, OutboxStatus::Completed, task.retry_count)
                        .await;
                    tracing::info!(id = task.id, key = %task.key, "outbox task completed");
                }
                Err(err) => {
                    let retry_count = task.retry_count + 1;
                    if retry_count >= MAX_RETRIES {
                        // Surfaced for operator attention; the reconciler
                        // still repairs the row eventually.
                        tracing::error!(id = task.id, error = %err, "outbox task exceeded retries");
                        metrics::counter!("mizuflow_outbox_failed_total").increment(1);
                        self.settle(task.id, OutboxStatus::Failed, retry_count).await;
                    } else {
                        tracing::warn!(
                            id = task.id,
                            retry = retry_count,
                            error = %err,
                            "outbox projection failed, will retry"
                        );
                        self.settle(task.id, OutboxStatus::Pending, retry_count).await;
                    }
                }
            }
        }
    }

    async fn settle(&self, id: i64, status: OutboxStatus, retry_count: i32) {
        if let Err(err) = self.store.update_outbox_status(id, status, retry_count).await {
            tracing::error!(id, error = %err, "failed to update outbox task status");
        }
    }
}

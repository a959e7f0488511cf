// MizuFlow server binary.
//
// Assembles the pipeline: system-of-record store, watched store, hub,
// cache + ring, the HTTP API, and the three background loops (outbox
// worker, watch ingestor, reconciler). Everything shares one cancellation
// token; ctrl-c drains the lot.
use anyhow::Context;
use mizuflow_hub::{FeatureCache, Hub, HubConfig, RevisionRing};
use mizuflow_server::app::{build_router, AppState};
use mizuflow_server::config::{ServerConfig, StorageBackend};
use mizuflow_server::service::{
    run_supervised, FeatureService, Ingestor, OutboxWorker, Reconciler,
};
use mizuflow_server::store::memory::MemoryFlagStore;
use mizuflow_server::store::postgres::PostgresFlagStore;
use mizuflow_server::store::FlagStore;
use mizuflow_server::observability;
use mizuflow_watch::{MemoryWatchedStore, WatchedStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = observability::init_observability("mizuflow-server");
    let config = ServerConfig::from_env_or_yaml().context("server config")?;

    let store: Arc<dyn FlagStore> = match config.storage {
        StorageBackend::Memory => Arc::new(MemoryFlagStore::new()),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(PostgresFlagStore::connect(pg).await?)
        }
    };
    tracing::info!(
        backend = store.backend_name(),
        durable = store.is_durable(),
        "system-of-record ready"
    );

    // Deployments with an external consistent store plug it in behind the
    // WatchedStore trait; the in-process backend serves single-node setups.
    let watched: Arc<dyn WatchedStore> = Arc::new(MemoryWatchedStore::new());

    let shutdown = CancellationToken::new();
    let hub = Hub::spawn(
        HubConfig {
            heartbeat_interval: config.heartbeat_interval,
            client_buffer: config.client_buffer,
        },
        shutdown.clone(),
    );
    let cache = Arc::new(FeatureCache::new());
    let ring = Arc::new(RevisionRing::new(config.ring_capacity));

    let features = Arc::new(FeatureService::new(
        Arc::clone(&store),
        Arc::clone(&watched),
        Arc::clone(&cache),
        Arc::clone(&ring),
        hub.clone(),
    ));

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let ingestor = Ingestor::new(
        Arc::clone(&watched),
        Arc::clone(&cache),
        Arc::clone(&ring),
        hub.clone(),
    );
    tokio::spawn(run_supervised(
        ingestor,
        shutdown.clone(),
        config.ingestor_restart_delay,
    ));

    let outbox = OutboxWorker::new(
        Arc::clone(&store),
        Arc::clone(&watched),
        config.outbox_interval,
        config.outbox_batch,
    );
    let outbox_shutdown = shutdown.clone();
    tokio::spawn(async move { outbox.run(outbox_shutdown).await });

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&watched),
        config.reconciler_interval,
        config.reconciler_batch_size,
        config.reconciler_batch_delay,
    );
    let reconciler_shutdown = shutdown.clone();
    tokio::spawn(async move { reconciler.run(reconciler_shutdown).await });

    let app = build_router(AppState {
        features,
        store,
        operator_token: config.operator_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "mizuflow server listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = serve_shutdown.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    Ok(())
}

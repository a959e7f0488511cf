// MizuFlow SDK.
//
// The client keeps a local mirror of the flags it subscribes to: a snapshot
// fetch seeds the mirror, a resumable SSE stream keeps it fresh, and every
// read is served from memory. The mirror is periodically persisted so a
// process that restarts while the server is down still has values to serve.
use anyhow::{Context, Result};
use futures::StreamExt;
use mizuflow_wire::{EventMessage, FeatureFlag, SDK_KEY_HEADER};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod cache;
mod config;
mod evaluate;
mod sse;

pub use config::ClientConfig;

use cache::LocalCache;
use evaluate::evaluate_value;
use sse::{LineSplitter, SseParser};

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    data: Vec<FeatureFlag>,
    revision: i64,
}

struct ClientInner {
    config: ClientConfig,
    http: reqwest::Client,
    cache: LocalCache,
}

/// Long-lived MizuFlow client.
///
/// `start` seeds the cache and spawns the background subscribe and persist
/// loops; the accessors are cheap and lock-free enough to call per request.
pub struct MizuClient {
    inner: Arc<ClientInner>,
    shutdown: CancellationToken,
}

impl MizuClient {
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::new();
        Self {
            inner: Arc::new(ClientInner {
                config,
                http,
                cache: LocalCache::default(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Seeds the cache (from the server, or from the persisted snapshot when
    /// the server is unreachable) and starts the background loops. Fails only
    /// when neither source yields data.
    pub async fn start(&self) -> Result<()> {
        if let Err(err) = fetch_snapshot(&self.inner).await {
            tracing::warn!(error = %err, "snapshot fetch failed, trying local cache");
            self.inner
                .cache
                .load(&self.inner.config.cache_file)
                .with_context(|| format!("server unreachable ({err:#}) and local cache unusable"))?;
            tracing::info!(
                flags = self.inner.cache.len(),
                rev = self.inner.cache.last_rev(),
                "serving from persisted local cache"
            );
        }

        tokio::spawn(run_watch_loop(
            Arc::clone(&self.inner),
            self.shutdown.clone(),
        ));
        tokio::spawn(run_snapshot_loop(
            Arc::clone(&self.inner),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// Stops the background loops. The cache stays readable.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Resolves a flag for the given attributes. `None` means the key is
    /// unknown to the cache.
    pub fn evaluate(&self, key: &str, attrs: &HashMap<String, String>) -> Option<String> {
        let flag = self.inner.cache.get(key)?;
        Some(evaluate_value(&flag, attrs))
    }

    /// True iff the flag resolves to exactly `"true"`, `"True"`, or `"TRUE"`.
    /// Anything else — including `"1"`, `"yes"`, `"on"`, or a missing key —
    /// is false. This is a deliberate contract, not an accident.
    pub fn is_enabled(&self, key: &str, attrs: &HashMap<String, String>) -> bool {
        matches!(
            self.evaluate(key, attrs).as_deref(),
            Some("true" | "True" | "TRUE")
        )
    }

    pub fn get_string(&self, key: &str, default: &str, attrs: &HashMap<String, String>) -> String {
        self.evaluate(key, attrs)
            .unwrap_or_else(|| default.to_string())
    }

    /// Numeric accessor; parse failures fall back to `default`.
    pub fn get_number(&self, key: &str, default: f64, attrs: &HashMap<String, String>) -> f64 {
        self.evaluate(key, attrs)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    /// JSON accessor. Unlike the other accessors this errors on a missing
    /// key, because there is no sensible zero value to hand back.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        attrs: &HashMap<String, String>,
    ) -> Result<T> {
        let value = self
            .evaluate(key, attrs)
            .with_context(|| format!("flag not found: {key}"))?;
        serde_json::from_str(&value).with_context(|| format!("flag {key} is not valid json"))
    }

    /// Highest revision applied to the local cache.
    pub fn last_revision(&self) -> i64 {
        self.inner.cache.last_rev()
    }
}

impl Drop for MizuClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn fetch_snapshot(inner: &ClientInner) -> Result<()> {
    let url = format!(
        "{}/v1/stream/snapshot?env={}&namespace={}",
        inner.config.trimmed_base_url(),
        inner.config.env,
        inner.config.namespace_param(),
    );
    let response = inner
        .http
        .get(&url)
        .header(SDK_KEY_HEADER, &inner.config.api_key)
        .timeout(inner.config.http_timeout)
        .send()
        .await
        .context("snapshot request")?
        .error_for_status()
        .context("snapshot status")?;
    let body: SnapshotResponse = response.json().await.context("snapshot body")?;
    tracing::info!(flags = body.data.len(), rev = body.revision, "snapshot loaded");
    inner.cache.seed(body.data, body.revision);
    Ok(())
}

enum StreamEnd {
    /// Server told us our resume point is unusable; resnapshot and re-watch.
    Reset,
    /// Connection ended (server close or heartbeat silence); reconnect.
    Disconnected,
    Shutdown,
}

async fn run_watch_loop(inner: Arc<ClientInner>, shutdown: CancellationToken) {
    let mut backoff = inner.config.initial_backoff;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match stream_once(&inner, &shutdown).await {
            Ok(StreamEnd::Shutdown) => return,
            Ok(StreamEnd::Reset) => {
                tracing::warn!("reset received, discarding local state and resyncing");
                if let Err(err) = fetch_snapshot(&inner).await {
                    tracing::error!(error = %err, "resync snapshot fetch failed");
                }
                backoff = halve(backoff, inner.config.initial_backoff);
            }
            Ok(StreamEnd::Disconnected) => {
                // The connection was established, so the endpoint is healthy;
                // ease the backoff rather than resetting it outright.
                backoff = halve(backoff, inner.config.initial_backoff);
            }
            Err(err) => {
                let jitter = Duration::from_millis(
                    rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2),
                );
                tracing::warn!(error = %err, backoff = ?backoff, "stream disconnected");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff + jitter) => {}
                }
                backoff = (backoff * 2).min(inner.config.max_backoff);
            }
        }
    }
}

fn halve(backoff: Duration, floor: Duration) -> Duration {
    (backoff / 2).max(floor)
}

async fn stream_once(inner: &ClientInner, shutdown: &CancellationToken) -> Result<StreamEnd> {
    let url = format!(
        "{}/v1/stream/watch?last_rev={}&env={}&namespace={}",
        inner.config.trimmed_base_url(),
        inner.cache.last_rev(),
        inner.config.env,
        inner.config.namespace_param(),
    );
    let response = inner
        .http
        .get(&url)
        .header(SDK_KEY_HEADER, &inner.config.api_key)
        .send()
        .await
        .context("open stream")?
        .error_for_status()
        .context("stream status")?;

    let mut body = response.bytes_stream();
    let mut splitter = LineSplitter::default();
    let mut parser = SseParser::default();

    loop {
        // Every received chunk resets the heartbeat watchdog; the server
        // pings well inside this window, so silence means a dead connection.
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => return Ok(StreamEnd::Shutdown),
            next = tokio::time::timeout(inner.config.heartbeat_timeout, body.next()) => {
                match next {
                    Err(_) => {
                        tracing::warn!("heartbeat timeout, reconnecting");
                        return Ok(StreamEnd::Disconnected);
                    }
                    Ok(None) => return Ok(StreamEnd::Disconnected),
                    Ok(Some(chunk)) => chunk.context("read stream chunk")?,
                }
            }
        };

        for line in splitter.push(&chunk) {
            let Some(event) = parser.push_line(&line) else {
                continue;
            };
            match event.event.as_str() {
                "reset" => return Ok(StreamEnd::Reset),
                "ping" => {}
                "message" => {
                    match serde_json::from_str::<EventMessage>(&event.data) {
                        Ok(msg) => {
                            if inner.cache.apply(&msg) {
                                tracing::debug!(
                                    key = %msg.key,
                                    action = ?msg.action,
                                    rev = msg.revision,
                                    "feature update applied"
                                );
                            }
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "malformed stream event");
                        }
                    }
                }
                other => tracing::debug!(event = other, "ignoring unknown stream event"),
            }
        }
    }
}

async fn run_snapshot_loop(inner: Arc<ClientInner>, shutdown: CancellationToken) {
    loop {
        let min = inner.config.snapshot_interval_min;
        let max = inner.config.snapshot_interval_max;
        let spread = max.saturating_sub(min).as_millis() as u64;
        let wait = min + Duration::from_millis(rand::thread_rng().gen_range(0..=spread.max(1)));
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        match inner.cache.persist_if_dirty(&inner.config.cache_file) {
            Ok(true) => tracing::debug!(rev = inner.cache.last_rev(), "cache snapshot persisted"),
            Ok(false) => {}
            Err(err) => tracing::error!(error = %err, "cache snapshot write failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::sse::{Event, Sse};
    use axum::routing::get;
    use axum::{Json, Router};
    use mizuflow_wire::{Action, FlagType};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seeded_client(flags: Vec<FeatureFlag>) -> MizuClient {
        let client = MizuClient::new(ClientConfig::new(
            "http://127.0.0.1:0",
            "dev",
            "test-key",
            vec!["default".to_string()],
        ));
        client.inner.cache.seed(flags, 1);
        client
    }

    fn flag(key: &str, value: &str, flag_type: FlagType) -> FeatureFlag {
        FeatureFlag {
            namespace: "default".to_string(),
            env: "dev".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            flag_type,
            version: 1,
            revision: 1,
        }
    }

    #[tokio::test]
    async fn is_enabled_accepts_exactly_three_spellings() {
        let client = seeded_client(vec![
            flag("t1", "true", FlagType::Bool),
            flag("t2", "True", FlagType::Bool),
            flag("t3", "TRUE", FlagType::Bool),
            flag("f1", "false", FlagType::Bool),
            flag("f2", "1", FlagType::Bool),
            flag("f3", "yes", FlagType::Bool),
            flag("f4", "on", FlagType::Bool),
            flag("f5", "tRue", FlagType::Bool),
        ]);
        let attrs = HashMap::new();
        for key in ["t1", "t2", "t3"] {
            assert!(client.is_enabled(key, &attrs), "{key} should be enabled");
        }
        for key in ["f1", "f2", "f3", "f4", "f5", "missing"] {
            assert!(!client.is_enabled(key, &attrs), "{key} should be disabled");
        }
    }

    #[tokio::test]
    async fn typed_accessors_fall_back_on_bad_values() {
        let client = seeded_client(vec![
            flag("n", "2.5", FlagType::Number),
            flag("bad-n", "not-a-number", FlagType::Number),
            flag("j", r#"{"limit": 3}"#, FlagType::Json),
        ]);
        let attrs = HashMap::new();
        assert_eq!(client.get_number("n", 0.0, &attrs), 2.5);
        assert_eq!(client.get_number("bad-n", 7.0, &attrs), 7.0);
        assert_eq!(client.get_number("missing", 7.0, &attrs), 7.0);
        assert_eq!(client.get_string("missing", "fallback", &attrs), "fallback");

        #[derive(Deserialize)]
        struct Limits {
            limit: u32,
        }
        let parsed: Limits = client.get_json("j", &attrs).expect("json");
        assert_eq!(parsed.limit, 3);
        assert!(client.get_json::<Limits>("missing", &attrs).is_err());
    }

    async fn serve(router: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn watch_loop_applies_streamed_updates() {
        let update = EventMessage {
            namespace: "default".to_string(),
            env: "dev".to_string(),
            key: "exp".to_string(),
            value: "42".to_string(),
            flag_type: FlagType::Number,
            version: 1,
            revision: 5,
            action: Action::Put,
        };
        let payload = serde_json::to_string(&update).expect("payload");

        let router = Router::new()
            .route(
                "/v1/stream/snapshot",
                get(|| async {
                    Json(serde_json::json!({ "data": [], "revision": 0 }))
                }),
            )
            .route(
                "/v1/stream/watch",
                get(move || {
                    let payload = payload.clone();
                    async move {
                        let events = futures::stream::iter(vec![Ok::<_, Infallible>(
                            Event::default().event("message").data(payload),
                        )])
                        .chain(futures::stream::pending());
                        Sse::new(events)
                    }
                }),
            );
        let (addr, server) = serve(router).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let config = ClientConfig::new(
            format!("http://{addr}"),
            "dev",
            "test-key",
            vec!["default".to_string()],
        )
        .with_cache_file(dir.path().join("cache.json"))
        .with_snapshot_interval(Duration::from_secs(60), Duration::from_secs(60));
        let client = MizuClient::new(config);
        client.start().await.expect("start");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if client.last_revision() == 5 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "update never applied"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            client.get_number("exp", 0.0, &HashMap::new()),
            42.0
        );

        client.stop();
        server.abort();
    }

    #[tokio::test]
    async fn reset_event_triggers_resnapshot() {
        let snapshot_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&snapshot_calls);

        let router = Router::new()
            .route(
                "/v1/stream/snapshot",
                get(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(serde_json::json!({ "data": [], "revision": 100 }))
                    }
                }),
            )
            .route(
                "/v1/stream/watch",
                get(|| async {
                    let events = futures::stream::iter(vec![Ok::<_, Infallible>(
                        Event::default().event("reset").data("revision_too_old"),
                    )])
                    .chain(futures::stream::pending());
                    Sse::new(events)
                }),
            );
        let (addr, server) = serve(router).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let config = ClientConfig::new(
            format!("http://{addr}"),
            "dev",
            "test-key",
            vec!["default".to_string()],
        )
        .with_cache_file(dir.path().join("cache.json"))
        .with_snapshot_interval(Duration::from_secs(60), Duration::from_secs(60));
        let client = MizuClient::new(config);
        client.start().await.expect("start");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if snapshot_calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "reset never forced a resnapshot"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        client.stop();
        server.abort();
    }

    #[tokio::test]
    async fn start_falls_back_to_local_cache_when_server_is_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");

        // Seed a snapshot file through a first client.
        let writer = seeded_client(vec![flag("exp", "true", FlagType::Bool)]);
        writer
            .inner
            .cache
            .persist_if_dirty(&path)
            .expect("persist");

        // Unroutable port: snapshot fetch fails, cache file carries the day.
        let config = ClientConfig::new(
            "http://127.0.0.1:1",
            "dev",
            "test-key",
            vec!["default".to_string()],
        )
        .with_cache_file(path)
        .with_snapshot_interval(Duration::from_secs(60), Duration::from_secs(60))
        .with_backoff(Duration::from_secs(30), Duration::from_secs(30));
        let client = MizuClient::new(config);
        client.start().await.expect("start from cache");
        assert!(client.is_enabled("exp", &HashMap::new()));
        client.stop();
    }
}

// Client-side defaults and configuration.
use std::path::PathBuf;
use std::time::Duration;

pub(crate) const DEFAULT_CACHE_FILE: &str = ".mizu_cache.json";
pub(crate) const DEFAULT_SNAPSHOT_INTERVAL_MIN: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_SNAPSHOT_INTERVAL_MAX: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(25);
pub(crate) const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`crate::MizuClient`].
///
/// `base_url`, `env`, `api_key`, and at least one namespace are required;
/// everything else has working defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub env: String,
    pub api_key: String,
    pub namespaces: Vec<String>,
    /// Local snapshot file used for cold starts when the server is down.
    pub cache_file: PathBuf,
    /// Dirty snapshots are persisted at a random point in this interval so a
    /// fleet of clients does not hit the disk in lockstep.
    pub snapshot_interval_min: Duration,
    pub snapshot_interval_max: Duration,
    /// A stream idle longer than this is treated as dead and reconnected.
    pub heartbeat_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Timeout for non-streaming requests (snapshot fetch).
    pub http_timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        env: impl Into<String>,
        api_key: impl Into<String>,
        namespaces: Vec<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            env: env.into(),
            api_key: api_key.into(),
            namespaces,
            cache_file: PathBuf::from(DEFAULT_CACHE_FILE),
            snapshot_interval_min: DEFAULT_SNAPSHOT_INTERVAL_MIN,
            snapshot_interval_max: DEFAULT_SNAPSHOT_INTERVAL_MAX,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = path.into();
        self
    }

    pub fn with_snapshot_interval(mut self, min: Duration, max: Duration) -> Self {
        self.snapshot_interval_min = min;
        self.snapshot_interval_max = max.max(min);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub(crate) fn namespace_param(&self) -> String {
        self.namespaces.join(",")
    }

    pub(crate) fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

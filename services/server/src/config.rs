// Server configuration sourced from `MIZU_*` environment variables, with an
// optional YAML override file via `MIZU_CONFIG`.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_OUTBOX_BATCH: i64 = 10;
pub const DEFAULT_RECONCILER_BATCH_SIZE: i64 = 100;
pub const DEFAULT_RING_CAPACITY: usize = 1000;
pub const DEFAULT_CLIENT_BUFFER: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address for the API.
    pub bind_addr: SocketAddr,
    /// Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    /// System-of-record backend. Postgres is selected by providing a DSN.
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    /// Bearer token required on operator endpoints. When unset (local
    /// development), operator endpoints accept any caller.
    pub operator_token: Option<String>,
    pub outbox_interval: Duration,
    pub outbox_batch: i64,
    pub reconciler_interval: Duration,
    pub reconciler_batch_size: i64,
    pub reconciler_batch_delay: Option<Duration>,
    pub heartbeat_interval: Duration,
    /// Per-subscriber stream buffer; a full buffer evicts the subscriber.
    pub client_buffer: usize,
    pub ring_capacity: usize,
    pub ingestor_restart_delay: Duration,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    postgres_url: Option<String>,
    operator_token: Option<String>,
    outbox_interval_ms: Option<u64>,
    outbox_batch: Option<i64>,
    reconciler_interval_ms: Option<u64>,
    reconciler_batch_size: Option<i64>,
    reconciler_batch_delay_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    client_buffer: Option<usize>,
    ring_capacity: Option<usize>,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("parse {name}")),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_string("MIZU_BIND")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("parse MIZU_BIND")?;
        let metrics_bind = env_string("MIZU_METRICS_BIND")
            .unwrap_or_else(|| "0.0.0.0:9090".to_string())
            .parse()
            .context("parse MIZU_METRICS_BIND")?;

        let postgres_url = env_string("MIZU_POSTGRES_DSN").or_else(|| env_string("DATABASE_URL"));
        let (storage, postgres) = match postgres_url {
            Some(url) => (
                StorageBackend::Postgres,
                Some(PostgresConfig {
                    url,
                    max_connections: env_parsed("MIZU_POSTGRES_MAX_CONNECTIONS")?.unwrap_or(10),
                    acquire_timeout_secs: env_parsed("MIZU_POSTGRES_ACQUIRE_TIMEOUT_SECS")?
                        .unwrap_or(5),
                    idle_timeout_secs: env_parsed("MIZU_POSTGRES_IDLE_TIMEOUT_SECS")?
                        .unwrap_or(600),
                }),
            ),
            None => (StorageBackend::Memory, None),
        };

        Ok(Self {
            bind_addr,
            metrics_bind,
            storage,
            postgres,
            operator_token: env_string("MIZU_OPERATOR_TOKEN"),
            outbox_interval: Duration::from_millis(
                env_parsed("MIZU_OUTBOX_INTERVAL_MS")?.unwrap_or(2000),
            ),
            outbox_batch: env_parsed("MIZU_OUTBOX_BATCH")?.unwrap_or(DEFAULT_OUTBOX_BATCH),
            reconciler_interval: Duration::from_millis(
                env_parsed("MIZU_RECONCILER_INTERVAL_MS")?.unwrap_or(60_000),
            ),
            reconciler_batch_size: env_parsed("MIZU_RECONCILER_BATCH_SIZE")?
                .unwrap_or(DEFAULT_RECONCILER_BATCH_SIZE),
            reconciler_batch_delay: env_parsed::<u64>("MIZU_RECONCILER_BATCH_DELAY_MS")?
                .map(Duration::from_millis),
            heartbeat_interval: Duration::from_millis(
                env_parsed("MIZU_HEARTBEAT_INTERVAL_MS")?.unwrap_or(15_000),
            ),
            client_buffer: env_parsed("MIZU_CLIENT_BUFFER")?.unwrap_or(DEFAULT_CLIENT_BUFFER),
            ring_capacity: env_parsed("MIZU_RING_CAPACITY")?.unwrap_or(DEFAULT_RING_CAPACITY),
            ingestor_restart_delay: Duration::from_millis(
                env_parsed("MIZU_INGESTOR_RESTART_DELAY_MS")?.unwrap_or(3000),
            ),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("MIZU_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read MIZU_CONFIG: {path}"))?;
            let override_cfg: ServerConfigOverride =
                serde_yaml::from_str(&contents).context("parse server config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }
}

impl ServerConfigOverride {
    fn apply(self, config: &mut ServerConfig) -> Result<()> {
        if let Some(value) = self.bind_addr {
            config.bind_addr = value.parse().context("parse bind_addr")?;
        }
        if let Some(value) = self.metrics_bind {
            config.metrics_bind = value.parse().context("parse metrics_bind")?;
        }
        if let Some(url) = self.postgres_url {
            config.storage = StorageBackend::Postgres;
            config.postgres = Some(PostgresConfig {
                url,
                max_connections: 10,
                acquire_timeout_secs: 5,
                idle_timeout_secs: 600,
            });
        }
        if let Some(value) = self.operator_token {
            config.operator_token = Some(value);
        }
        if let Some(value) = self.outbox_interval_ms {
            config.outbox_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.outbox_batch {
            config.outbox_batch = value;
        }
        if let Some(value) = self.reconciler_interval_ms {
            config.reconciler_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.reconciler_batch_size {
            config.reconciler_batch_size = value;
        }
        if let Some(value) = self.reconciler_batch_delay_ms {
            config.reconciler_batch_delay = Some(Duration::from_millis(value));
        }
        if let Some(value) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.client_buffer {
            config.client_buffer = value;
        }
        if let Some(value) = self.ring_capacity {
            config.ring_capacity = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn clear_mizu_env() {
        for (key, _) in env::vars() {
            if key.starts_with("MIZU_") || key == "DATABASE_URL" {
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_mizu_env();
        let config = ServerConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.metrics_bind.to_string(), "0.0.0.0:9090");
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(config.operator_token.is_none());
        assert_eq!(config.outbox_interval, Duration::from_secs(2));
        assert_eq!(config.ring_capacity, DEFAULT_RING_CAPACITY);
    }

    #[serial]
    #[test]
    fn postgres_dsn_selects_postgres_backend() {
        clear_mizu_env();
        unsafe {
            env::set_var("MIZU_POSTGRES_DSN", "postgres://localhost/mizuflow");
        }
        let config = ServerConfig::from_env().expect("from_env");
        assert_eq!(config.storage, StorageBackend::Postgres);
        assert_eq!(
            config.postgres.expect("postgres").url,
            "postgres://localhost/mizuflow"
        );
        clear_mizu_env();
    }

    #[serial]
    #[test]
    fn invalid_bind_addr_fails() {
        clear_mizu_env();
        unsafe {
            env::set_var("MIZU_BIND", "not-an-address");
        }
        assert!(ServerConfig::from_env().is_err());
        clear_mizu_env();
    }

    #[serial]
    #[test]
    fn yaml_overrides_env_defaults() {
        clear_mizu_env();
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "bind_addr: \"127.0.0.1:7070\"\nheartbeat_interval_ms: 5000\nring_capacity: 64\n",
        )
        .expect("write config");
        unsafe {
            env::set_var("MIZU_CONFIG", path.to_str().expect("utf8 path"));
        }
        let config = ServerConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7070");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.ring_capacity, 64);
        clear_mizu_env();
    }

    #[serial]
    #[test]
    fn missing_yaml_file_fails() {
        clear_mizu_env();
        unsafe {
            env::set_var("MIZU_CONFIG", "/nonexistent/mizu.yml");
        }
        assert!(ServerConfig::from_env_or_yaml().is_err());
        clear_mizu_env();
    }
}

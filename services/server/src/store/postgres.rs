//! Postgres-backed implementation of the system-of-record store.
//!
//! # Consistency / atomicity
//! `save_feature` runs the master upsert, the audit insert, and the outbox
//! insert in one transaction. This is the load-bearing property of the
//! outbox pattern: the watched store sits outside the transactional
//! boundary, so the only way to guarantee eventual projection is to commit
//! the intent (the outbox row) together with the state it projects.
//!
//! # Operational notes
//! - Migrations are embedded at compile time via `sqlx::migrate!` and run at
//!   startup, before the API serves requests.
//! - Pool timeouts are configured explicitly; hanging forever on a sick
//!   database is not acceptable for a control-plane service.
//! - Durability comes from the Postgres deployment itself (WAL/fsync,
//!   replication, backups); this module assumes it is configured for real
//!   durability.
use super::{
    AuditRow, FeatureFilter, FeatureRow, FeatureWrite, FlagStore, OutboxStatus, OutboxTask,
    SaveOutcome, SdkKeyRow, StoreError, StoreResult,
};
use crate::config::PostgresConfig;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mizuflow_wire::{FeatureFlag, FlagKey, FlagType};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Row};
use std::str::FromStr;
use std::time::Duration;

pub struct PostgresFlagStore {
    pool: PgPool,
}

/// Row shape for `feature_masters`. DB-facing structs are kept separate from
/// the domain types so schema details (column names, string enums) stay
/// localized here.
#[derive(Debug, Clone, FromRow)]
struct DbFeature {
    id: i64,
    namespace: String,
    env: String,
    key: String,
    flag_type: String,
    version: i64,
    current_value: String,
    updated_by: String,
    updated_at: DateTime<Utc>,
}

impl DbFeature {
    fn into_row(self) -> StoreResult<FeatureRow> {
        Ok(FeatureRow {
            id: self.id,
            namespace: self.namespace,
            env: self.env,
            key: self.key,
            flag_type: parse_flag_type(&self.flag_type)?,
            version: self.version,
            current_value: self.current_value,
            updated_by: self.updated_by,
            updated_at: self.updated_at,
        })
    }
}

/// Row shape for `feature_audits`.
#[derive(Debug, Clone, FromRow)]
struct DbAudit {
    id: i64,
    namespace: String,
    env: String,
    key: String,
    old_value: String,
    new_value: String,
    flag_type: String,
    operator: String,
    trace_id: String,
    created_at: DateTime<Utc>,
}

impl DbAudit {
    fn into_row(self) -> StoreResult<AuditRow> {
        Ok(AuditRow {
            id: self.id,
            namespace: self.namespace,
            env: self.env,
            key: self.key,
            old_value: self.old_value,
            new_value: self.new_value,
            flag_type: parse_flag_type(&self.flag_type)?,
            operator: self.operator,
            trace_id: self.trace_id,
            created_at: self.created_at,
        })
    }
}

/// Row shape for `outbox_tasks`. Status is a smallint (0 pending,
/// 1 completed, 2 failed).
#[derive(Debug, Clone, FromRow)]
struct DbOutbox {
    id: i64,
    key: String,
    payload: String,
    status: i16,
    retry_count: i32,
    trace_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DbOutbox {
    fn into_task(self) -> StoreResult<OutboxTask> {
        Ok(OutboxTask {
            id: self.id,
            key: self.key,
            payload: self.payload,
            status: OutboxStatus::from_i16(self.status)?,
            retry_count: self.retry_count,
            trace_id: self.trace_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row shape for `sdk_clients`.
#[derive(Debug, Clone, FromRow)]
struct DbSdkKey {
    id: i64,
    app_id: String,
    api_key: String,
    env: String,
    active: bool,
}

fn parse_flag_type(raw: &str) -> StoreResult<FlagType> {
    FlagType::from_str(raw).map_err(|err| StoreError::Unexpected(anyhow!(err)))
}

fn unexpected(err: sqlx::Error) -> StoreError {
    StoreError::Unexpected(anyhow!(err))
}

impl PostgresFlagStore {
    /// Connects, applies pool limits/timeouts, and runs migrations.
    pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl FlagStore for PostgresFlagStore {
    async fn save_feature(&self, write: FeatureWrite) -> StoreResult<SaveOutcome> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        // Lock the master row for the duration of the transaction so two
        // concurrent writes to the same identity serialize on the version.
        let existing = sqlx::query_as::<_, DbFeature>(
            "SELECT id, namespace, env, key, flag_type, version, current_value, updated_by, updated_at \
             FROM feature_masters WHERE namespace = $1 AND env = $2 AND key = $3 FOR UPDATE",
        )
        .bind(&write.namespace)
        .bind(&write.env)
        .bind(&write.key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unexpected)?;

        let (version, old_value) = match &existing {
            None => (1, String::new()),
            Some(row) => (row.version + 1, row.current_value.clone()),
        };

        match existing {
            Some(row) => {
                sqlx::query(
                    "UPDATE feature_masters SET version = $2, current_value = $3, flag_type = $4, \
                     updated_by = $5, updated_at = now() WHERE id = $1",
                )
                .bind(row.id)
                .bind(version)
                .bind(&write.value)
                .bind(write.flag_type.as_str())
                .bind(&write.operator)
                .execute(&mut *tx)
                .await
                .map_err(unexpected)?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO feature_masters (namespace, env, key, flag_type, version, current_value, updated_by) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(&write.namespace)
                .bind(&write.env)
                .bind(&write.key)
                .bind(write.flag_type.as_str())
                .bind(version)
                .bind(&write.value)
                .bind(&write.operator)
                .execute(&mut *tx)
                .await
                .map_err(unexpected)?;
            }
        }

        sqlx::query(
            "INSERT INTO feature_audits (namespace, env, key, old_value, new_value, flag_type, operator, trace_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&write.namespace)
        .bind(&write.env)
        .bind(&write.key)
        .bind(&old_value)
        .bind(&write.value)
        .bind(write.flag_type.as_str())
        .bind(&write.operator)
        .bind(&write.trace_id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        let flag = FeatureFlag {
            namespace: write.namespace,
            env: write.env,
            key: write.key,
            value: write.value,
            flag_type: write.flag_type,
            version,
            revision: 0,
        };
        let payload = serde_json::to_string(&flag).map_err(|err| StoreError::Unexpected(anyhow!(err)))?;

        let outbox_id: i64 = sqlx::query(
            "INSERT INTO outbox_tasks (key, payload, status, retry_count, trace_id) \
             VALUES ($1, $2, 0, 0, $3) RETURNING id",
        )
        .bind(&flag.key)
        .bind(&payload)
        .bind(&write.trace_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?
        .get(0);

        tx.commit().await.map_err(unexpected)?;

        Ok(SaveOutcome {
            version,
            outbox_id,
            flag,
        })
    }

    async fn get_feature(&self, key: &FlagKey) -> StoreResult<Option<FeatureRow>> {
        let row = sqlx::query_as::<_, DbFeature>(
            "SELECT id, namespace, env, key, flag_type, version, current_value, updated_by, updated_at \
             FROM feature_masters WHERE namespace = $1 AND env = $2 AND key = $3",
        )
        .bind(&key.namespace)
        .bind(&key.env)
        .bind(&key.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        row.map(DbFeature::into_row).transpose()
    }

    async fn list_features(&self, filter: &FeatureFilter) -> StoreResult<Vec<FeatureRow>> {
        let rows = sqlx::query_as::<_, DbFeature>(
            "SELECT id, namespace, env, key, flag_type, version, current_value, updated_by, updated_at \
             FROM feature_masters \
             WHERE ($1::text IS NULL OR namespace = $1) \
               AND ($2::text IS NULL OR env = $2) \
               AND ($3::text IS NULL OR key LIKE '%' || $3 || '%') \
             ORDER BY updated_at DESC",
        )
        .bind(&filter.namespace)
        .bind(&filter.env)
        .bind(&filter.search)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        rows.into_iter().map(DbFeature::into_row).collect()
    }

    async fn page_features(&self, after_id: i64, limit: i64) -> StoreResult<Vec<FeatureRow>> {
        let rows = sqlx::query_as::<_, DbFeature>(
            "SELECT id, namespace, env, key, flag_type, version, current_value, updated_by, updated_at \
             FROM feature_masters WHERE id > $1 ORDER BY id ASC LIMIT $2",
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        rows.into_iter().map(DbFeature::into_row).collect()
    }

    async fn get_audit(&self, id: i64) -> StoreResult<AuditRow> {
        let row = sqlx::query_as::<_, DbAudit>(
            "SELECT id, namespace, env, key, old_value, new_value, flag_type, operator, trace_id, created_at \
             FROM feature_audits WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        row.map(DbAudit::into_row)
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("audit {id}")))
    }

    async fn list_audits(&self, key: &FlagKey) -> StoreResult<Vec<AuditRow>> {
        let rows = sqlx::query_as::<_, DbAudit>(
            "SELECT id, namespace, env, key, old_value, new_value, flag_type, operator, trace_id, created_at \
             FROM feature_audits WHERE namespace = $1 AND env = $2 AND key = $3 ORDER BY id DESC",
        )
        .bind(&key.namespace)
        .bind(&key.env)
        .bind(&key.key)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        rows.into_iter().map(DbAudit::into_row).collect()
    }

    async fn fetch_pending_outbox(&self, limit: i64) -> StoreResult<Vec<OutboxTask>> {
        let rows = sqlx::query_as::<_, DbOutbox>(
            "SELECT id, key, payload, status, retry_count, trace_id, created_at, updated_at \
             FROM outbox_tasks WHERE status = 0 ORDER BY id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        rows.into_iter().map(DbOutbox::into_task).collect()
    }

    async fn update_outbox_status(
        &self,
        id: i64,
        status: OutboxStatus,
        retry_count: i32,
    ) -> StoreResult<()> {
        // The status guard keeps the progression monotone: a settled task
        // never goes back to pending, no matter how late a retry lands.
        sqlx::query(
            "UPDATE outbox_tasks SET status = $2, retry_count = $3, updated_at = now() \
             WHERE id = $1 AND status = 0",
        )
        .bind(id)
        .bind(status.as_i16())
        .bind(retry_count)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn find_sdk_key(&self, api_key: &str) -> StoreResult<Option<SdkKeyRow>> {
        let row = sqlx::query_as::<_, DbSdkKey>(
            "SELECT id, app_id, api_key, env, active FROM sdk_clients WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(row.map(|row| SdkKeyRow {
            id: row.id,
            app_id: row.app_id,
            api_key: row.api_key,
            env: row.env,
            active: row.active,
        }))
    }

    async fn insert_sdk_key(
        &self,
        app_id: &str,
        api_key: &str,
        env: &str,
    ) -> StoreResult<SdkKeyRow> {
        let result = sqlx::query_as::<_, DbSdkKey>(
            "INSERT INTO sdk_clients (app_id, api_key, env) VALUES ($1, $2, $3) \
             RETURNING id, app_id, api_key, env, active",
        )
        .bind(app_id)
        .bind(api_key)
        .bind(env)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(row) => Ok(SdkKeyRow {
                id: row.id,
                app_id: row.app_id,
                api_key: row.api_key,
                env: row.env,
                active: row.active,
            }),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::Conflict(format!("sdk key for {app_id}")))
            }
            Err(err) => Err(unexpected(err)),
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn is_durable(&self) -> bool {
        true
    }
}

//! System-of-record store for the control plane.
//!
//! # Purpose
//! The system-of-record holds three kinds of rows: the authoritative flag
//! masters, the immutable audit history, and the outbox tasks that carry
//! pending projections to the watched store. A write is one transaction
//! across all three — either the master update, its audit entry, and its
//! outbox task all commit, or none do. That coupling is what makes the
//! outbox pattern sound: a committed write can always be projected later,
//! even if the process dies immediately after commit.
//!
//! Two implementations exist behind the same trait:
//! - `memory`: single-process, for development and tests
//! - `postgres`: durable, via sqlx with embedded migrations
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mizuflow_wire::{FeatureFlag, FlagKey, FlagType};
use thiserror::Error;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Authoritative row for a flag identity.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub id: i64,
    pub namespace: String,
    pub env: String,
    pub key: String,
    pub flag_type: FlagType,
    pub version: i64,
    pub current_value: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl FeatureRow {
    pub fn flag_key(&self) -> FlagKey {
        FlagKey::new(&self.namespace, &self.env, &self.key)
    }

    /// The projection payload for this row. Revision is assigned by the
    /// watched store, so it is zero here.
    pub fn to_flag(&self) -> FeatureFlag {
        FeatureFlag {
            namespace: self.namespace.clone(),
            env: self.env.clone(),
            key: self.key.clone(),
            value: self.current_value.clone(),
            flag_type: self.flag_type,
            version: self.version,
            revision: 0,
        }
    }
}

/// Immutable history row, one per committed write. Rollback references an
/// audit row by id and replays its `old_value` as a forward write.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub namespace: String,
    pub env: String,
    pub key: String,
    pub old_value: String,
    pub new_value: String,
    pub flag_type: FlagType,
    pub operator: String,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            OutboxStatus::Pending => 0,
            OutboxStatus::Completed => 1,
            OutboxStatus::Failed => 2,
        }
    }

    pub fn from_i16(raw: i16) -> StoreResult<Self> {
        match raw {
            0 => Ok(OutboxStatus::Pending),
            1 => Ok(OutboxStatus::Completed),
            2 => Ok(OutboxStatus::Failed),
            other => Err(StoreError::Unexpected(anyhow::anyhow!(
                "invalid outbox status {other}"
            ))),
        }
    }
}

/// A pending (or settled) projection task. Created in the same transaction
/// as its master/audit rows; leaves `Pending` only when the payload has been
/// durably accepted by the watched store, or `Failed` after the retry
/// ceiling.
#[derive(Debug, Clone)]
pub struct OutboxTask {
    pub id: i64,
    pub key: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SDK credential row; validates `X-Mizu-Key` for an environment.
#[derive(Debug, Clone)]
pub struct SdkKeyRow {
    pub id: i64,
    pub app_id: String,
    pub api_key: String,
    pub env: String,
    pub active: bool,
}

/// Input to the transactional write path.
#[derive(Debug, Clone)]
pub struct FeatureWrite {
    pub namespace: String,
    pub env: String,
    pub key: String,
    pub value: String,
    pub flag_type: FlagType,
    pub operator: String,
    pub trace_id: String,
}

/// What a committed write produced: the assigned version, the outbox task to
/// settle after projection, and the flag payload carrying that version.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub version: i64,
    pub outbox_id: i64,
    pub flag: FeatureFlag,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureFilter {
    pub namespace: Option<String>,
    pub env: Option<String>,
    pub search: Option<String>,
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    /// The transactional write: load-or-initialize the master (version 1 on
    /// first write, version + 1 after), append the audit row, append a
    /// pending outbox task, commit. Nothing is visible unless all three
    /// land.
    async fn save_feature(&self, write: FeatureWrite) -> StoreResult<SaveOutcome>;

    async fn get_feature(&self, key: &FlagKey) -> StoreResult<Option<FeatureRow>>;
    async fn list_features(&self, filter: &FeatureFilter) -> StoreResult<Vec<FeatureRow>>;

    /// Page through all masters ordered by id, for the reconciler. Returns
    /// rows with `id > after_id`, at most `limit`.
    async fn page_features(&self, after_id: i64, limit: i64) -> StoreResult<Vec<FeatureRow>>;

    async fn get_audit(&self, id: i64) -> StoreResult<AuditRow>;
    async fn list_audits(&self, key: &FlagKey) -> StoreResult<Vec<AuditRow>>;

    /// Oldest pending outbox tasks, ordered by id.
    async fn fetch_pending_outbox(&self, limit: i64) -> StoreResult<Vec<OutboxTask>>;

    /// Settles an outbox task. Status progression is monotone: only a
    /// `Pending` task can change state, so a completed task never returns
    /// to pending.
    async fn update_outbox_status(
        &self,
        id: i64,
        status: OutboxStatus,
        retry_count: i32,
    ) -> StoreResult<()>;

    async fn find_sdk_key(&self, api_key: &str) -> StoreResult<Option<SdkKeyRow>>;
    async fn insert_sdk_key(&self, app_id: &str, api_key: &str, env: &str)
        -> StoreResult<SdkKeyRow>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
    fn is_durable(&self) -> bool;
}

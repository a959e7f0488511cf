// Request/response DTOs for the HTTP API. Kept separate from the domain
// types so the wire shapes can evolve without touching the stores.
use crate::store::{AuditRow, FeatureRow};
use chrono::{DateTime, Utc};
use mizuflow_wire::{FeatureFlag, FlagType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SaveFeatureRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub env: String,
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
}

#[derive(Debug, Deserialize)]
pub struct RollbackFeatureRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub env: String,
    pub key: String,
    pub audit_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureItem {
    pub id: i64,
    pub namespace: String,
    pub env: String,
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub version: i64,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl From<FeatureRow> for FeatureItem {
    fn from(row: FeatureRow) -> Self {
        Self {
            id: row.id,
            namespace: row.namespace,
            env: row.env,
            key: row.key,
            flag_type: row.flag_type,
            version: row.version,
            value: row.current_value,
            updated_at: row.updated_at,
            updated_by: row.updated_by,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureListResponse {
    pub items: Vec<FeatureItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditLogItem {
    pub id: i64,
    pub namespace: String,
    pub env: String,
    pub key: String,
    pub old_value: String,
    pub new_value: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub operator: String,
    pub created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditLogItem {
    fn from(row: AuditRow) -> Self {
        Self {
            id: row.id,
            namespace: row.namespace,
            env: row.env,
            key: row.key,
            old_value: row.old_value,
            new_value: row.new_value,
            flag_type: row.flag_type,
            operator: row.operator,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditListResponse {
    pub items: Vec<AuditLogItem>,
}

/// Snapshot payload: current flags plus the global revision to resume the
/// stream from.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub data: Vec<FeatureFlag>,
    pub revision: i64,
}

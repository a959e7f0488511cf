// Operator-facing write and read endpoints.
use crate::api::error::{api_validation_error, ApiError};
use crate::api::types::{
    AuditListResponse, FeatureItem, FeatureListResponse, RollbackFeatureRequest,
    SaveFeatureRequest, VersionResponse,
};
use crate::app::AppState;
use crate::auth::authorize_operator;
use crate::store::{FeatureFilter, FeatureWrite};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use mizuflow_wire::FlagKey;
use serde::Deserialize;

// Create or update a flag. The assigned version comes back so the caller
// can observe the write ordering.
pub async fn save_feature(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SaveFeatureRequest>,
) -> Result<Json<VersionResponse>, ApiError> {
    let operator = authorize_operator(&state, &headers)?;
    if body.env.is_empty() || body.key.is_empty() || body.namespace.is_empty() {
        return Err(api_validation_error("namespace, env, and key are required"));
    }

    let trace_id = uuid::Uuid::new_v4().to_string();
    let version = state
        .features
        .save_feature(FeatureWrite {
            namespace: body.namespace,
            env: body.env,
            key: body.key,
            value: body.value,
            flag_type: body.flag_type,
            operator,
            trace_id,
        })
        .await?;
    Ok(Json(VersionResponse { version }))
}

// Rollback by audit id: a forward write of the audited old value.
pub async fn rollback_feature(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RollbackFeatureRequest>,
) -> Result<Json<VersionResponse>, ApiError> {
    let operator = authorize_operator(&state, &headers)?;
    if body.env.is_empty() || body.key.is_empty() || body.namespace.is_empty() {
        return Err(api_validation_error("namespace, env, and key are required"));
    }

    let identity = FlagKey::new(body.namespace, body.env, body.key);
    let trace_id = uuid::Uuid::new_v4().to_string();
    let version = state
        .features
        .rollback_feature(&identity, body.audit_id, &operator, trace_id)
        .await?;
    Ok(Json(VersionResponse { version }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
    pub env: Option<String>,
    pub search: Option<String>,
}

pub async fn list_features(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<FeatureListResponse>, ApiError> {
    authorize_operator(&state, &headers)?;
    let rows = state
        .features
        .list_features(&FeatureFilter {
            namespace: query.namespace.filter(|value| !value.is_empty()),
            env: query.env.filter(|value| !value.is_empty()),
            search: query.search.filter(|value| !value.is_empty()),
        })
        .await?;
    Ok(Json(FeatureListResponse {
        items: rows.into_iter().map(FeatureItem::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct IdentityQuery {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub key: String,
}

impl IdentityQuery {
    fn into_key(self) -> Result<FlagKey, ApiError> {
        if self.namespace.is_empty() || self.env.is_empty() || self.key.is_empty() {
            return Err(api_validation_error("namespace, env, and key are required"));
        }
        Ok(FlagKey::new(self.namespace, self.env, self.key))
    }
}

pub async fn get_feature(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<IdentityQuery>,
) -> Result<Json<FeatureItem>, ApiError> {
    authorize_operator(&state, &headers)?;
    let row = state.features.get_feature(&query.into_key()?).await?;
    Ok(Json(FeatureItem::from(row)))
}

pub async fn list_audits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<IdentityQuery>,
) -> Result<Json<AuditListResponse>, ApiError> {
    authorize_operator(&state, &headers)?;
    let rows = state.features.list_audits(&query.into_key()?).await?;
    Ok(Json(AuditListResponse {
        items: rows.into_iter().map(Into::into).collect(),
    }))
}

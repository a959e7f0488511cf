//! HTTP application wiring.
//!
//! # Purpose
//! Builds the axum router and defines the shared application state injected
//! into handlers. Route composition lives here to keep `main` small and the
//! router testable.
use crate::api;
use crate::service::FeatureService;
use crate::store::FlagStore;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub features: Arc<FeatureService>,
    pub store: Arc<dyn FlagStore>,
    /// Bearer token for operator endpoints; `None` disables the check
    /// (local development).
    pub operator_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
            )
        });

    Router::new()
        .route("/v1/system/health", get(api::system::system_health))
        .route(
            "/v1/features",
            get(api::features::list_features).post(api::features::save_feature),
        )
        .route("/v1/features/rollback", post(api::features::rollback_feature))
        .route("/v1/features/item", get(api::features::get_feature))
        .route("/v1/features/audits", get(api::features::list_audits))
        .route("/v1/stream/watch", get(api::stream::watch_stream))
        .route("/v1/stream/dashboard", get(api::stream::dashboard_watch))
        .route("/v1/stream/snapshot", get(api::stream::snapshot))
        .layer(trace_layer)
        .with_state(state)
}

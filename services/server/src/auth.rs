// Request authentication.
//
// Two distinct callers hit this API: SDK clients, which present a per-env
// key in `X-Mizu-Key`, and operators, which present a static bearer token.
// Wildcard subscriptions and all write endpoints are operator-only.
use crate::api::error::{api_forbidden, api_internal, api_unauthorized, ApiError};
use crate::app::AppState;
use axum::http::HeaderMap;
use mizuflow_wire::SDK_KEY_HEADER;

/// Optional header naming the acting operator; recorded in audit rows.
pub const OPERATOR_HEADER: &str = "X-Mizu-Operator";

/// Validates the SDK key for the requested environment. When `env` is
/// `None` (unfiltered snapshot), any active key is accepted.
pub async fn authorize_sdk(
    state: &AppState,
    headers: &HeaderMap,
    env: Option<&str>,
) -> Result<(), ApiError> {
    let Some(api_key) = headers
        .get(SDK_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    else {
        return Err(api_unauthorized("missing sdk key"));
    };

    let row = state
        .store
        .find_sdk_key(api_key)
        .await
        .map_err(|err| api_internal("failed to validate sdk key", &err))?;

    match row {
        None => Err(api_unauthorized("unknown sdk key")),
        Some(row) if !row.active => Err(api_forbidden("sdk key disabled")),
        Some(row) => match env {
            Some(env) if row.env != env => Err(api_forbidden("sdk key not valid for env")),
            _ => Ok(()),
        },
    }
}

/// Validates the operator bearer token and resolves the operator name for
/// audit attribution. With no token configured (local development) every
/// caller is accepted.
pub fn authorize_operator(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    if let Some(expected) = &state.operator_token {
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        match presented {
            None => return Err(api_unauthorized("missing operator token")),
            Some(token) if token != expected => {
                return Err(api_forbidden("invalid operator token"));
            }
            Some(_) => {}
        }
    }
    Ok(headers
        .get(OPERATOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("operator")
        .to_string())
}

// Subscriber-facing endpoints: the SSE watch stream, the operator
// dashboard stream, and the snapshot fetch.
//
// A connection's protocol is: replay compensation first (or a single
// `reset` when the ring no longer covers the client's `last_rev`), then
// live events from the hub, filtered by env + namespace and deduped so the
// revisions a client sees are strictly increasing across the replay/live
// seam.
use crate::api::error::{
    api_forbidden, api_internal_message, api_validation_error, ApiError,
};
use crate::api::types::SnapshotResponse;
use crate::app::AppState;
use crate::auth::{authorize_operator, authorize_sdk};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use futures::StreamExt;
use mizuflow_hub::hub::ClientId;
use mizuflow_hub::{Hub, StreamEvent, Subscription};
use std::collections::HashSet;
use std::convert::Infallible;
use tokio::sync::mpsc;

#[derive(Debug, serde::Deserialize)]
pub struct WatchQuery {
    pub last_rev: Option<i64>,
    pub env: Option<String>,
    pub namespace: Option<String>,
}

pub async fn watch_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WatchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let env = query
        .env
        .filter(|value| !value.is_empty())
        .ok_or_else(|| api_validation_error("env is required"))?;
    let namespaces = parse_namespaces(query.namespace.as_deref())?;
    if namespaces.contains("*") {
        // Wildcards are for operator dashboards, never SDK keys.
        return Err(api_forbidden("wildcard subscription requires operator auth"));
    }
    authorize_sdk(&state, &headers, Some(&env)).await?;

    let last_rev = query.last_rev.unwrap_or(0);
    let subscription = state
        .features
        .hub()
        .subscribe(env.clone(), namespaces.clone())
        .await
        .ok_or_else(|| api_internal_message("hub unavailable"))?;
    tracing::info!(env = %env, last_rev, "subscriber connected");
    metrics::counter!("mizuflow_stream_connections_total").increment(1);

    // Replay compensation before any live event.
    let (replay, ok) = state.features.compensation(last_rev);
    let mut max_sent_rev = last_rev;
    let mut head: Vec<Result<Event, Infallible>> = Vec::new();
    if ok {
        for msg in replay {
            if msg.env != env || !namespaces.contains(&msg.namespace) {
                continue;
            }
            if let Some(event) = data_event(&msg) {
                max_sent_rev = msg.revision;
                head.push(Ok(event));
            }
        }
    } else {
        head.push(Ok(Event::default().event("reset").data("revision_too_old")));
    }

    let live = live_stream(
        state.features.hub().clone(),
        subscription,
        Some(StreamFilter { env, namespaces }),
        max_sent_rev,
        true,
    );
    Ok(sse_response(futures::stream::iter(head).chain(live)))
}

#[derive(Debug, serde::Deserialize)]
pub struct DashboardQuery {
    pub env: Option<String>,
}

// Wildcard stream for operator dashboards: everything, unfiltered, no
// replay.
pub async fn dashboard_watch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DashboardQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let operator = authorize_operator(&state, &headers)?;
    tracing::info!(operator = %operator, "dashboard subscriber connected");

    let subscription = state
        .features
        .hub()
        .subscribe(
            query.env.unwrap_or_default(),
            HashSet::from(["*".to_string()]),
        )
        .await
        .ok_or_else(|| api_internal_message("hub unavailable"))?;

    let live = live_stream(
        state.features.hub().clone(),
        subscription,
        None,
        0,
        false,
    );
    Ok(sse_response(live))
}

#[derive(Debug, serde::Deserialize)]
pub struct SnapshotQuery {
    pub env: Option<String>,
    pub namespace: Option<String>,
}

pub async fn snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let env_filter = query.env.filter(|value| !value.is_empty());
    authorize_sdk(&state, &headers, env_filter.as_deref()).await?;

    let namespace_filter: Option<HashSet<String>> = query
        .namespace
        .filter(|value| !value.is_empty())
        .map(|raw| split_namespaces(&raw));

    let (flags, revision) = state.features.snapshot();
    let data = flags
        .into_iter()
        .filter(|flag| {
            env_filter.as_ref().is_none_or(|env| &flag.env == env)
                && namespace_filter
                    .as_ref()
                    .is_none_or(|set| set.contains(&flag.namespace))
        })
        .collect();
    Ok(Json(SnapshotResponse { data, revision }))
}

struct StreamFilter {
    env: String,
    namespaces: HashSet<String>,
}

// Removes the hub registration when the SSE body is dropped. Unsubscribe is
// async and Drop is not, so the actual removal is handed to the runtime.
struct UnsubscribeOnDrop {
    hub: Hub,
    id: ClientId,
}

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = self.id;
        tokio::spawn(async move { hub.unsubscribe(id).await });
    }
}

struct LiveState {
    events: mpsc::Receiver<StreamEvent>,
    filter: Option<StreamFilter>,
    max_sent_rev: i64,
    dedupe: bool,
    _guard: UnsubscribeOnDrop,
}

fn live_stream(
    hub: Hub,
    subscription: Subscription,
    filter: Option<StreamFilter>,
    max_sent_rev: i64,
    dedupe: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = LiveState {
        events: subscription.events,
        filter,
        max_sent_rev,
        dedupe,
        _guard: UnsubscribeOnDrop {
            hub,
            id: subscription.id,
        },
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            // None means the hub closed the channel: eviction or shutdown.
            let event = state.events.recv().await?;
            match event {
                StreamEvent::Ping => {
                    return Some((Ok(Event::default().event("ping").data("pong")), state));
                }
                StreamEvent::Message(msg) => {
                    if let Some(filter) = &state.filter {
                        if msg.env != filter.env || !filter.namespaces.contains(&msg.namespace) {
                            continue;
                        }
                    }
                    // Dedupe across the replay/live seam.
                    if state.dedupe && msg.revision <= state.max_sent_rev {
                        continue;
                    }
                    state.max_sent_rev = msg.revision;
                    let Some(event) = data_event(&msg) else { continue };
                    metrics::counter!("mizuflow_stream_events_total").increment(1);
                    return Some((Ok(event), state));
                }
            }
        }
    })
}

// `Sse` itself only sets `Content-Type: text/event-stream`; the stream
// contract also promises `Cache-Control: no-cache` and
// `Connection: keep-alive`, so both are added explicitly.
fn sse_response<S>(stream: S) -> impl IntoResponse
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream),
    )
}

fn data_event(msg: &mizuflow_wire::EventMessage) -> Option<Event> {
    match serde_json::to_string(msg) {
        Ok(payload) => Some(Event::default().event("message").data(payload)),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize stream event");
            None
        }
    }
}

fn parse_namespaces(raw: Option<&str>) -> Result<HashSet<String>, ApiError> {
    let set = raw.map(split_namespaces).unwrap_or_default();
    if set.is_empty() {
        return Err(api_validation_error("at least one namespace is required"));
    }
    Ok(set)
}

fn split_namespaces(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

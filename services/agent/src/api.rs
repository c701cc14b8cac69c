//! The agent HTTP API (`/api/v0`).
//!
//! Thin translation between the wire and the container runloops. PUT is
//! accept-then-work: the container is registered and 202 returned while
//! create/start proceed in the background; the scheduler observes progress
//! through GET polls and the event stream.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::stream;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use flotilla_api::{
    Advisory, ContainerConfig, Error, Heartbeat, HeartbeatReply, API_VERSION_PREFIX,
    CONTAINERS_EVENT, CONTAINER_EVENT,
};

use crate::config::Config;
use crate::container::{Container, ContainerContext};
use crate::registry::Registry;
use crate::resources;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub ctx: Arc<ContainerContext>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/containers/:id",
            put(handle_put).get(handle_get).delete(handle_delete),
        )
        .route("/containers/:id/start", post(handle_start))
        .route("/containers/:id/stop", post(handle_stop))
        .route("/containers/:id/restart", post(handle_restart))
        .route("/containers/:id/heartbeat", post(handle_heartbeat))
        .route("/containers/:id/log", get(handle_log))
        .route("/containers", get(handle_list))
        .route("/resources", get(handle_resources))
        .with_state(state);

    Router::new()
        .nest(API_VERSION_PREFIX, api)
        .layer(TraceLayer::new_for_http())
}

/// Maps the shared error taxonomy onto HTTP statuses.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AgentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::OperationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::RuntimeFailure(_) | Error::Lost(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

async fn handle_put(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ContainerConfig>,
) -> Result<StatusCode, ApiError> {
    if id.is_empty() {
        return Err(Error::InvalidInput("no id specified".to_string()).into());
    }
    config.valid()?;

    let container = Container::new(id.clone(), config, state.ctx.clone());
    state.registry.register(container.clone()).await?;

    // Accepted; create and start proceed in the background. Failures are
    // reflected in the container's status for the scheduler to observe.
    tokio::spawn(async move {
        if let Err(e) = container.create().await {
            warn!(container_id = %id, error = %e, "create failed");
            return;
        }
        if let Err(e) = container.start().await {
            warn!(container_id = %id, error = %e, "start failed");
        }
    });

    Ok(StatusCode::ACCEPTED)
}

async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let container = lookup(&state, &id)?;
    let instance = container.instance().await?;
    Ok(Json(instance).into_response())
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let container = lookup(&state, &id)?;
    container.destroy().await?;
    state.registry.remove(&id);
    info!(container_id = %id, "container deleted");
    Ok(StatusCode::OK)
}

async fn handle_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let container = lookup(&state, &id)?;
    container.start().await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct StopQuery {
    /// Shutdown window in seconds; defaults to the container's grace.
    t: Option<u64>,
}

async fn handle_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, ApiError> {
    let container = lookup(&state, &id)?;
    let timeout = match query.t {
        Some(secs) => Duration::from_secs(secs),
        None => Duration::from_secs(container.instance().await?.config.grace.shutdown),
    };
    container.stop(timeout).await;
    Ok(StatusCode::ACCEPTED)
}

async fn handle_restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let container = lookup(&state, &id)?;
    container.restart().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn handle_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(heartbeat): Json<Heartbeat>,
) -> Json<HeartbeatReply> {
    // An unknown id answers EXIT so orphaned supervisors terminate.
    let want = match state.registry.get(&id) {
        Some(container) => container.heartbeat(heartbeat).await,
        None => Advisory::Exit,
    };
    Json(HeartbeatReply {
        want,
        err: String::new(),
    })
}

async fn handle_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !accepts_event_stream(&headers) {
        return Json(state.registry.instances().await).into_response();
    }

    // Subscribe before snapshotting: a change landing in between is
    // delivered twice (instances are complete states, so upserts are
    // idempotent) rather than lost.
    let (sink, events) = tokio::sync::mpsc::channel(64);
    state.registry.notify(sink);
    let instances = state.registry.instances().await;

    let initial = Event::default()
        .event(CONTAINERS_EVENT)
        .json_data(&instances);

    let live = stream::unfold(events, |mut events| async move {
        let instance = events.recv().await?;
        let event = Event::default()
            .event(CONTAINER_EVENT)
            .json_data(&instance);
        Some((event, events))
    });

    let stream = futures_util::StreamExt::chain(stream::iter([initial]), live);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    history: Option<usize>,
}

async fn handle_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let container = lookup(&state, &id)?;
    let history = query.history.unwrap_or(100);
    let last = container.log().last(history).await;

    if !accepts_event_stream(&headers) {
        return Ok(Json(last).into_response());
    }

    let (sink, events) = tokio::sync::mpsc::channel(64);
    container.log().notify(sink).await;

    let initial = stream::iter(last.into_iter().map(|line| {
        Event::default().event("log").json_data(&line)
    }));
    let live = stream::unfold(events, |mut events| async move {
        let line = events.recv().await?;
        let event = Event::default()
            .event("log")
            .json_data(&line);
        Some((event, events))
    });

    let stream = futures_util::StreamExt::chain(initial, live);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn handle_resources(State(state): State<AppState>) -> Response {
    Json(resources::host_resources(&state.config, &state.registry).await).into_response()
}

fn lookup(state: &AppState, id: &str) -> Result<Container, ApiError> {
    state
        .registry
        .get(id)
        .ok_or_else(|| ApiError(Error::NotFound(format!("container {id} unknown"))))
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .map(|accept| {
            accept
                .split(',')
                .any(|part| part.trim().starts_with("text/event-stream"))
        })
        .unwrap_or(false)
}

//! HTTP API.
//!
//! Session management under `/api/sessions`, device-facing configuration
//! downloads under `/config`, and a health probe.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{RegistryError, StatusError};
use crate::fetch::FetchLedger;
use crate::mac::HardwareAddress;
use crate::registry::SessionFilter;
use crate::render::{ConfigPayload, ConfigRenderer, BASE_CONFIG_NAME};
use crate::service::{ProvisionRequest, Provisioner};
use crate::session::SessionId;
use crate::status::StatusEvent;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    provisioner: Arc<Provisioner>,
    renderer: Arc<dyn ConfigRenderer>,
    fetches: Arc<FetchLedger>,
    /// `host:port` written into the base script.
    server_address: String,
}

impl ApiState {
    #[must_use]
    pub fn new(
        provisioner: Arc<Provisioner>,
        renderer: Arc<dyn ConfigRenderer>,
        fetches: Arc<FetchLedger>,
        server_address: impl Into<String>,
    ) -> Self {
        Self {
            provisioner,
            renderer,
            fetches,
            server_address: server_address.into(),
        }
    }
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/timeline", get(session_timeline))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/configs", get(list_configs))
        .route("/api/configs/{mac}", delete(delete_config))
        .route("/config/{file}", get(serve_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Provisioning API listening on {addr}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Error responses as `{"error": "..."}`.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Internal(m) => {
                error!("Request failed: {m}");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::SessionNotFound(_) => Self::NotFound(err.to_string()),
            RegistryError::Store(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::SessionNotFound(_) => Self::NotFound(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    SessionId::parse(raw).ok_or_else(|| ApiError::NotFound(format!("Session not found: {raw}")))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct CreatedSession {
    session_id: SessionId,
    status_url: String,
    events_url: String,
}

async fn create_session(
    State(state): State<ApiState>,
    payload: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedSession>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let id = state.provisioner.start(request).await.map_err(|e| {
        if e.is_bad_request() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedSession {
            session_id: id,
            status_url: format!("/api/sessions/{id}"),
            events_url: format!("/api/sessions/{id}/events"),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    filter: Option<String>,
}

async fn list_sessions(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = match query.filter.as_deref() {
        None | Some("all") => SessionFilter::All,
        Some("active") => SessionFilter::Active,
        Some("completed") => SessionFilter::Completed,
        Some(other) => return Err(ApiError::BadRequest(format!("unknown filter: {other}"))),
    };
    let sessions = state.provisioner.registry().list(filter).await?;
    Ok(Json(json!({ "total": sessions.len(), "sessions": sessions })))
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.provisioner.registry().get(id).await?))
}

async fn session_timeline(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    let timeline = state.provisioner.registry().timeline(id).await?;
    Ok(Json(json!({ "session_id": id, "timeline": timeline })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    after: Option<u64>,
}

async fn session_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_session_id(&id)?;
    // a reconnecting EventSource resumes from its last id
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let after = last_event_id.or(query.after).unwrap_or(0);

    let subscription = state
        .provisioner
        .registry()
        .bus()
        .subscribe_after(id, after)
        .await?;

    let stream = subscription.into_stream().map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &StatusEvent) -> Event {
    let frame = Event::default().id(event.sequence.to_string());
    match serde_json::to_string(event) {
        Ok(data) => frame.data(data),
        Err(e) => {
            warn!("Failed to serialize status event: {e}");
            frame.comment("failed to serialize event")
        }
    }
}

async fn cancel_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_session_id(&id)?;
    if state.provisioner.registry().cancel(id).await? {
        Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "session_id": id, "status": "cancelling" })),
        ))
    } else {
        Err(ApiError::Conflict(format!("Session {id} already finished")))
    }
}

async fn delete_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    state.provisioner.registry().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn script_response(payload: ConfigPayload) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        payload.body,
    )
        .into_response()
}

fn parse_config_address(raw: &str) -> Result<HardwareAddress, ApiError> {
    let stem = raw.strip_suffix(".rsc").unwrap_or(raw);
    HardwareAddress::parse(stem)
        .map_err(|_| ApiError::NotFound(format!("No configuration for {raw}")))
}

/// Device-facing download of `base.rsc` or `<mac>.rsc`.
async fn serve_config(
    State(state): State<ApiState>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    if file == BASE_CONFIG_NAME {
        let payload = match state.renderer.lookup_base().await {
            Some(payload) => payload,
            None => state
                .renderer
                .render_base(&state.server_address)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?,
        };
        info!("Serving base configuration");
        return Ok(script_response(payload));
    }

    if !file.ends_with(".rsc") {
        return Err(ApiError::NotFound(format!("No configuration named {file}")));
    }
    let hardware_address = parse_config_address(&file)?;
    let payload = state
        .renderer
        .lookup(&hardware_address)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No configuration for {hardware_address}")))?;

    state.fetches.record(hardware_address).await;
    Ok(script_response(payload))
}

async fn list_configs(State(state): State<ApiState>) -> impl IntoResponse {
    let mut entries = state.renderer.list().await;
    for entry in &mut entries {
        if let Some(hw) = entry.hardware_address {
            entry.fetched_at = state.fetches.last_fetch(&hw).await;
        }
    }
    Json(json!({ "total": entries.len(), "configs": entries }))
}

async fn delete_config(
    State(state): State<ApiState>,
    Path(mac): Path<String>,
) -> Result<StatusCode, ApiError> {
    let hardware_address = parse_config_address(&mac)?;
    if state.renderer.remove(&hardware_address).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No configuration for {hardware_address}")))
    }
}

//! Request channel (JSON over HTTP) and push channel (SSE) for the relay.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp_relay::aggregator::SessionAggregator;
use mcp_relay::client::{ClientDeps, ConnectOutcome};
use mcp_relay::error::{AuthError, ConnectError, StoreError, ToolCallError};
use mcp_relay::session::{ConnectionState, ServerConfig, SessionRecord, ToolInfo, TransportType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    deps: ClientDeps,
    aggregators: RwLock<HashMap<String, Arc<SessionAggregator>>>,
    heartbeat: Duration,
    default_callback_url: Option<String>,
}

impl AppState {
    pub fn new(
        deps: ClientDeps,
        heartbeat: Duration,
        default_callback_url: Option<String>,
    ) -> Self {
        Self {
            deps,
            aggregators: RwLock::new(HashMap::new()),
            heartbeat,
            default_callback_url,
        }
    }

    /// One aggregator per identity, created on first touch.
    async fn aggregator(&self, identity: &str) -> Arc<SessionAggregator> {
        if let Some(agg) = self.aggregators.read().await.get(identity) {
            return Arc::clone(agg);
        }
        let mut aggregators = self.aggregators.write().await;
        Arc::clone(
            aggregators
                .entry(identity.to_string())
                .or_insert_with(|| {
                    Arc::new(SessionAggregator::new(self.deps.clone(), identity))
                }),
        )
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/{identity}/connect", post(connect))
        .route("/api/{identity}/sessions", get(list_sessions))
        .route("/api/{identity}/sessions/{session_id}/auth", post(finish_auth))
        .route("/api/{identity}/sessions/{session_id}/tools", get(list_tools))
        .route(
            "/api/{identity}/sessions/{session_id}/tools/{tool}",
            post(call_tool),
        )
        .route(
            "/api/{identity}/sessions/{session_id}",
            axum::routing::delete(disconnect),
        )
        .route("/api/{identity}/events", get(events))
        .route("/api/{identity}/config", get(aggregate_config))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.0,
            Json(serde_json::json!({ "error": self.1 })),
        )
            .into_response()
    }
}

impl From<ConnectError> for ApiError {
    fn from(err: ConnectError) -> Self {
        let status = match &err {
            ConnectError::UnknownSession(_) => StatusCode::NOT_FOUND,
            ConnectError::NotConnected { .. } => StatusCode::CONFLICT,
            ConnectError::Auth(AuthError::InvalidGrant(_)) => StatusCode::BAD_REQUEST,
            ConnectError::MissingConfig(_) => StatusCode::BAD_REQUEST,
            ConnectError::Transport(_) | ConnectError::Auth(_) => StatusCode::BAD_GATEWAY,
            ConnectError::NoCredentials => StatusCode::UNAUTHORIZED,
            ConnectError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::DuplicateSession(_) | StoreError::RevisionConflict { .. } => {
                StatusCode::CONFLICT
            }
            StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

impl From<ToolCallError> for ApiError {
    fn from(err: ToolCallError) -> Self {
        let status = match &err {
            ToolCallError::NotConnected { .. } => StatusCode::CONFLICT,
            ToolCallError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ToolCallError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        Self(status, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    server_name: String,
    server_url: String,
    #[serde(default)]
    callback_url: Option<String>,
    #[serde(default)]
    transport_type: TransportType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    session_id: String,
    status: &'static str,
    state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolInfo>>,
}

impl ConnectResponse {
    fn from_outcome(session_id: &str, state: ConnectionState, outcome: ConnectOutcome) -> Self {
        match outcome {
            ConnectOutcome::Connected { tools } => Self {
                session_id: session_id.to_string(),
                status: "connected",
                state,
                auth_url: None,
                tools: Some(tools),
            },
            ConnectOutcome::AuthRequired { auth_url } => Self {
                session_id: session_id.to_string(),
                status: "auth_required",
                state,
                auth_url: Some(auth_url),
                tools: None,
            },
        }
    }
}

async fn connect(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let callback_url = req
        .callback_url
        .or_else(|| state.default_callback_url.clone())
        .ok_or_else(|| {
            ApiError(
                StatusCode::BAD_REQUEST,
                "callbackUrl missing and no default is configured".to_string(),
            )
        })?;
    let config = ServerConfig {
        server_name: req.server_name,
        server_url: req.server_url,
        callback_url,
        transport_type: req.transport_type,
    };
    let agg = state.aggregator(&identity).await;
    let (client, outcome) = agg.connect_new(config).await?;
    Ok(Json(ConnectResponse::from_outcome(
        client.session_id(),
        client.state().await,
        outcome,
    )))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishAuthRequest {
    code: String,
    state: String,
}

async fn finish_auth(
    State(state): State<Arc<AppState>>,
    Path((identity, session_id)): Path<(String, String)>,
    Json(req): Json<FinishAuthRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let agg = state.aggregator(&identity).await;
    let outcome = agg.finish_auth(&session_id, &req.code, &req.state).await?;
    let client = agg.client_for(&session_id).await?;
    Ok(Json(ConnectResponse::from_outcome(
        &session_id,
        client.state().await,
        outcome,
    )))
}

/// Session snapshot with credentials and auth round-trip state stripped.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    session_id: String,
    server_name: String,
    server_url: String,
    state: ConnectionState,
    active: bool,
    revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl From<SessionRecord> for SessionSummary {
    fn from(record: SessionRecord) -> Self {
        Self {
            session_id: record.session_id,
            server_name: record.server_name,
            server_url: record.server_url,
            state: record.state,
            active: record.active,
            revision: record.revision,
            last_error: record.last_error,
        }
    }
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let records = state.deps.store.sessions_for_identity(&identity).await?;
    Ok(Json(records.into_iter().map(SessionSummary::from).collect()))
}

async fn list_tools(
    State(state): State<Arc<AppState>>,
    Path((identity, session_id)): Path<(String, String)>,
) -> Result<Json<Vec<ToolInfo>>, ApiError> {
    let agg = state.aggregator(&identity).await;
    let client = agg.client_for(&session_id).await?;
    // Serves the warm cache, or runs discovery for a session that still
    // holds credentials but lost its live connection.
    Ok(Json(client.list_tools().await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallResponse {
    is_error: bool,
    content: Vec<Value>,
}

async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path((identity, session_id, tool)): Path<(String, String, String)>,
    Json(arguments): Json<Value>,
) -> Result<Json<ToolCallResponse>, ApiError> {
    let agg = state.aggregator(&identity).await;
    let client = agg.client_for(&session_id).await?;
    let outcome = client
        .call_tool(&tool, arguments, &CancellationToken::new())
        .await?;
    Ok(Json(ToolCallResponse {
        is_error: outcome.is_error,
        content: outcome.content,
    }))
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path((identity, session_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let agg = state.aggregator(&identity).await;
    agg.disconnect(&session_id, "user_disconnect").await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn events(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.deps.events.subscribe(&identity);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => {
                let data = serde_json::to_string(&event).expect("valid json");
                Some((Ok(Event::default().data(data)), rx))
            }
            // A lagged subscriber dropped events; say so and carry on. The
            // client reconciles via the sessions snapshot.
            Err(RecvError::Lagged(skipped)) => Some((
                Ok(Event::default().comment(format!("lagged {skipped}"))),
                rx,
            )),
            Err(RecvError::Closed) => None,
        }
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.heartbeat)
            .text("keepalive"),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigEntry {
    session_id: String,
    server_name: String,
    server_url: String,
    state: ConnectionState,
    tool_count: usize,
}

/// Aggregate view keyed by label, the shape an MCP host consumes.
async fn aggregate_config(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Json<HashMap<String, ConfigEntry>> {
    let agg = state.aggregator(&identity).await;
    let mut out = HashMap::new();
    for entry in agg.tool_index().await {
        let Ok(client) = agg.client_for(&entry.session_id).await else {
            continue;
        };
        out.insert(
            entry.label,
            ConfigEntry {
                session_id: entry.session_id,
                server_name: entry.server_name,
                server_url: client.server_config().server_url.clone(),
                state: entry.state,
                tool_count: entry.tools.len(),
            },
        );
    }
    Json(out)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

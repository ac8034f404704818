//! The HTTP surface consumed by MCP clients: discovery, provisioning,
//! registration, and the transparent execute path.
//!
//! A thin layer: every handler recovers core errors into structured JSON
//! responses and otherwise delegates to the registry, gating engine, and
//! proxy.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::config::LaunchSpec;
use crate::embedding::{Embedder, EmbedderError};
use crate::gating::{self, DEFAULT_MAX_TOKENS, DEFAULT_MAX_TOOLS, DiscoverParams};
use crate::proxy::{AddServerError, ExecuteError, Proxy, ServerInfo, TrustedTool};
use crate::registry::{RegistryError, ToolRegistry, ToolSpec};
use crate::session::CallError;

/// Default number of discovery results per request.
const DEFAULT_DISCOVER_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ToolRegistry>,
    pub proxy: Arc<Proxy>,
    pub embedder: Arc<dyn Embedder>,
}

/// Structured error envelope: `{"error": <kind>, "detail": <message>}`, one
/// status code per kind.
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    BackendError(Value),
    GatewayTimeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, detail) = match self {
            ApiError::BadRequest(d) => (StatusCode::BAD_REQUEST, "bad_request", json!(d)),
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, "not_found", json!(d)),
            ApiError::Conflict(d) => (StatusCode::CONFLICT, "conflict", json!(d)),
            ApiError::Unavailable(d) => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable", json!(d))
            }
            ApiError::BackendError(payload) => (StatusCode::BAD_GATEWAY, "backend_error", payload),
            ApiError::GatewayTimeout(d) => (StatusCode::GATEWAY_TIMEOUT, "timeout", json!(d)),
            ApiError::Internal(d) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", json!(d)),
        };
        (status, Json(json!({"error": kind, "detail": detail}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateId(_) => ApiError::Conflict(e.to_string()),
            RegistryError::UnknownTool(_) => ApiError::NotFound(e.to_string()),
            RegistryError::VectorDimension { .. } => ApiError::BadRequest(e.to_string()),
            RegistryError::Embedder(inner) => ApiError::Internal(inner.to_string()),
        }
    }
}

impl From<EmbedderError> for ApiError {
    fn from(e: EmbedderError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<CallError> for ApiError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Timeout { .. } => ApiError::GatewayTimeout(e.to_string()),
            CallError::BackendUnavailable { .. } | CallError::Cancelled => {
                ApiError::Unavailable(e.to_string())
            }
            CallError::SessionLost { .. } => ApiError::Unavailable(e.to_string()),
            CallError::Backend(payload) => ApiError::BackendError(payload),
        }
    }
}

impl From<ExecuteError> for ApiError {
    fn from(e: ExecuteError) -> Self {
        match e {
            ExecuteError::UnknownTool(_) => ApiError::NotFound(e.to_string()),
            ExecuteError::NotRoutable(_) => ApiError::BadRequest(e.to_string()),
            ExecuteError::Call(inner) => inner.into(),
        }
    }
}

impl From<AddServerError> for ApiError {
    fn from(e: AddServerError) -> Self {
        match e {
            AddServerError::Config(inner) => ApiError::BadRequest(inner.to_string()),
            AddServerError::Connect(inner) => ApiError::Unavailable(inner.to_string()),
            AddServerError::Enumerate(inner) => inner.into(),
            AddServerError::Registry(inner) => inner.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tools/discover", post(discover_tools))
        .route("/api/tools/provision", post(provision_tools))
        .route("/api/tools/register", post(register_tool))
        .route("/api/tools/clear", delete(clear_tools))
        .route("/api/proxy/execute", post(execute_tool))
        .route("/api/mcp/add_server", post(add_server))
        .route("/api/mcp/ai/register-server", post(ai_register_server))
        .route("/api/mcp/servers", get(list_servers))
        .route("/api/mcp/servers/{name}", delete(remove_server))
        .with_state(state)
}

/// Bind and serve until the shutdown notify fires.
pub async fn serve(state: AppState, listen: &str, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(listen).await?;
    info!(listen = %listen, "gateway API started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    info!("gateway API stopped");
    Ok(())
}

// --- /api/health ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    total_tools: usize,
    total_backends: usize,
    backends: Vec<ServerInfo>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let backends = state.proxy.list_servers().await;
    let all_healthy = backends
        .iter()
        .all(|b| b.status == crate::session::SessionStatus::Connected);
    Json(HealthResponse {
        status: if all_healthy { "healthy" } else { "degraded" },
        total_tools: state.registry.len(),
        total_backends: backends.len(),
        backends,
    })
}

// --- /api/tools/discover ---

#[derive(Debug, Deserialize)]
struct DiscoverRequest {
    #[serde(default)]
    query: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct DiscoveredTool {
    tool_id: String,
    name: String,
    description: String,
    score: f32,
    matched_tags: Vec<String>,
    estimated_tokens: u32,
}

#[derive(Debug, Serialize)]
struct DiscoverResponse {
    tools: Vec<DiscoveredTool>,
    query_id: uuid::Uuid,
    timestamp: String,
}

async fn discover_tools(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let params = DiscoverParams {
        query: req.query,
        tags: req.tags,
        limit: req.limit.unwrap_or(DEFAULT_DISCOVER_LIMIT),
    };

    let ranked = gating::discover(&state.registry, state.embedder.as_ref(), &params)?;

    Ok(Json(DiscoverResponse {
        tools: ranked
            .into_iter()
            .map(|r| DiscoveredTool {
                tool_id: r.tool.id.clone(),
                name: r.tool.name.clone(),
                description: r.tool.description.clone(),
                score: r.score,
                matched_tags: r.matched_tags,
                estimated_tokens: r.tool.estimated_tokens,
            })
            .collect(),
        query_id: uuid::Uuid::new_v4(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

// --- /api/tools/provision ---

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    tool_ids: Vec<String>,
    #[serde(default)]
    max_tools: Option<usize>,
    #[serde(default)]
    max_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ProvisionedTool {
    name: String,
    description: String,
    parameters: Value,
    token_count: u32,
}

#[derive(Debug, Serialize)]
struct ProvisionMetadata {
    total_tokens: u64,
    gating_applied: bool,
}

#[derive(Debug, Serialize)]
struct ProvisionResponse {
    tools: Vec<ProvisionedTool>,
    metadata: ProvisionMetadata,
}

async fn provision_tools(
    State(state): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    let set = gating::provision_ids(
        &state.registry,
        &req.tool_ids,
        req.max_tools.unwrap_or(DEFAULT_MAX_TOOLS),
        req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    )?;

    Ok(Json(ProvisionResponse {
        tools: set
            .tools
            .iter()
            .map(|t| ProvisionedTool {
                // The flat id is the name the client calls back with.
                name: t.id.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
                token_count: t.estimated_tokens,
            })
            .collect(),
        metadata: ProvisionMetadata {
            total_tokens: set.total_tokens,
            gating_applied: set.gating_applied,
        },
    }))
}

// --- /api/tools/register ---

async fn register_tool(
    State(state): State<AppState>,
    Json(spec): Json<ToolSpec>,
) -> Result<impl IntoResponse, ApiError> {
    if spec.id.trim().is_empty() {
        return Err(ApiError::BadRequest("tool id must not be empty".to_string()));
    }
    let id = spec.id.clone();
    state.registry.insert(spec)?;
    Ok((StatusCode::CREATED, Json(json!({"id": id, "status": "registered"}))))
}

// --- /api/tools/clear ---

async fn clear_tools(State(state): State<AppState>) -> StatusCode {
    state.registry.clear();
    StatusCode::NO_CONTENT
}

// --- /api/proxy/execute ---

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    tool_id: String,
    #[serde(default)]
    arguments: Option<Value>,
}

async fn execute_tool(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let payload = state.proxy.execute(&req.tool_id, req.arguments).await?;
    Ok(Json(payload))
}

// --- /api/mcp/* ---

#[derive(Debug, Deserialize)]
struct AddServerRequest {
    name: String,
    config: LaunchSpec,
}

async fn add_server(
    State(state): State<AppState>,
    Json(req): Json<AddServerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state.proxy.add_server(&req.name, req.config, None).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"name": req.name, "tools_indexed": count})),
    ))
}

#[derive(Debug, Deserialize)]
struct AiRegisterRequest {
    name: String,
    config: LaunchSpec,
    tools: Vec<TrustedTool>,
}

async fn ai_register_server(
    State(state): State<AppState>,
    Json(req): Json<AiRegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state
        .proxy
        .add_server(&req.name, req.config, Some(req.tools))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"name": req.name, "tools_indexed": count})),
    ))
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerInfo>> {
    Json(state.proxy.list_servers().await)
}

async fn remove_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.proxy.remove_server(&name).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("server '{name}' not found")))
    }
}

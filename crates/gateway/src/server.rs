//! Axum-based HTTP server for the sandbox.

use axum::{
    extract::{Json, MatchedPath, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use agent_sandbox::{CommandExecutor, ContainerRegistry, IdleReaper};
use agent_sandbox_core::config::ServerConfig;
use agent_sandbox_core::traits::ToolRegistry;
use agent_sandbox_core::types::{ExecRequest, ExecResult, SessionId, ToolDefinition, ToolOutput};
use agent_sandbox_core::{Error, Result};
use agent_sandbox_governance::{set_active_containers, track_request};
use agent_sandbox_workspace::WorkspaceManager;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub enable_tracing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3400,
            enable_cors: false,
            enable_tracing: true,
        }
    }
}

impl From<&ServerConfig> for GatewayConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            enable_cors: config.enable_cors,
            enable_tracing: true,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub tools: Arc<dyn ToolRegistry>,
    pub executor: Arc<CommandExecutor>,
    pub containers: Arc<ContainerRegistry>,
    pub workspaces: Arc<WorkspaceManager>,
    pub reaper: Arc<IdleReaper>,
}

/// Gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
            metrics_handle: None,
        }
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/v1/tools", get(list_tools_handler))
            .route("/v1/sessions", get(list_sessions_handler))
            .route("/v1/sessions/:session_id", delete(delete_session_handler))
            .route("/v1/sessions/:session_id/exec", post(exec_handler))
            .route("/v1/sessions/:session_id/tools/:tool", post(tool_handler))
            .route("/v1/admin/reap", post(reap_handler))
            .with_state(self.state.clone());

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            let containers = self.state.containers.clone();
            router = router.route(
                "/metrics",
                get(move || async move {
                    set_active_containers(containers.len());
                    handle.render()
                }),
            );
        }

        router = router.layer(middleware::from_fn(track_metrics));

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Sandbox gateway listening");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        Ok(())
    }
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    track_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the container runtime is unreachable.
    pub status: String,
    pub version: String,
    pub runtime_available: bool,
    pub active_containers: usize,
    pub active_workspaces: usize,
}

/// Command execution request.
#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub command: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub tty: bool,
}

/// Live session entry.
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub container_id: String,
    pub idle_secs: u64,
}

/// Session teardown response.
#[derive(Debug, Serialize)]
pub struct DeleteSessionResponse {
    pub container_destroyed: bool,
    pub workspace_released: bool,
}

/// Reap response.
#[derive(Debug, Serialize)]
pub struct ReapResponse {
    pub reaped: usize,
    pub remaining: usize,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub trace_id: String,
}

/// Handler error mapped onto an HTTP status by kind.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// HTTP status for an error kind.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::SecurityViolation(_) => StatusCode::FORBIDDEN,
        Error::InvalidRequest(_) | Error::CommandRejected(_) => StatusCode::BAD_REQUEST,
        Error::ToolNotFound(_) => StatusCode::NOT_FOUND,
        Error::SandboxUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Decode(_) | Error::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let trace_id = Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(trace_id = %trace_id, code = self.0.code(), error = %self.0, "Request failed");
        } else {
            tracing::info!(trace_id = %trace_id, code = self.0.code(), error = %self.0, "Request rejected");
        }

        (
            status,
            Json(ErrorResponse {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
                trace_id,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let runtime_available = state.containers.runtime().ping().await;
    Json(HealthResponse {
        status: if runtime_available { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_available,
        active_containers: state.containers.len(),
        active_workspaces: state.workspaces.active_count(),
    })
}

async fn list_tools_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ToolDefinition>> {
    Ok(Json(state.tools.list().await?))
}

async fn list_sessions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    let sessions = state
        .containers
        .entries()
        .into_iter()
        .map(|entry| SessionInfo {
            session_id: entry.session_id,
            container_id: entry.container_id.0,
            idle_secs: entry.idle_for.as_secs(),
        })
        .collect();
    Json(sessions)
}

/// Invoke a tool on behalf of a session. The path's session wins over any
/// `session_id` in the body.
async fn tool_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, tool)): Path<(String, String)>,
    Json(mut args): Json<serde_json::Value>,
) -> ApiResult<ToolOutput> {
    let Some(object) = args.as_object_mut() else {
        return Err(Error::invalid_request("tool arguments must be a JSON object").into());
    };
    object.insert("session_id".to_string(), serde_json::Value::String(session_id.clone()));

    tracing::info!(session_id = %session_id, tool = %tool, "Tool call");
    Ok(Json(state.tools.execute(&tool, args).await?))
}

async fn exec_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<ExecBody>,
) -> ApiResult<ExecResult> {
    let request = ExecRequest {
        session_id: SessionId::new(session_id),
        command: body.command,
        env: body.env,
        tty: body.tty,
    };
    Ok(Json(state.executor.exec_command(&request).await?))
}

async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<DeleteSessionResponse> {
    let session_id = SessionId::new(session_id);
    let container_destroyed = state.containers.destroy(&session_id).await?;
    let workspace_released = state.workspaces.release(&session_id).await?;

    tracing::info!(
        session_id = %session_id,
        container_destroyed,
        workspace_released,
        "Session torn down"
    );
    Ok(Json(DeleteSessionResponse {
        container_destroyed,
        workspace_released,
    }))
}

async fn reap_handler(State(state): State<Arc<AppState>>) -> Json<ReapResponse> {
    let reaped = state.reaper.cleanup_expired().await;
    Json(ReapResponse {
        reaped,
        remaining: state.containers.len(),
    })
}

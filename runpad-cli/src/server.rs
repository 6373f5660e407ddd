//! HTTP service for executing generated projects
//!
//! `POST /run` executes a project and answers with the final result.
//! `POST /run/stream` answers with Server-Sent Events: `output` events as
//! the program writes, then one `result` or `error` event. A client that
//! disconnects cancels its execution.

use crate::config::AppConfig;
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use runpad_common::{ErrorKind, ErrorResponse, RunRequest, StreamEvent};
use runpad_sandbox::{ExecutionCoordinator, ExecutionRequest, SandboxError};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info};

/// Shared state for the HTTP service
#[derive(Clone)]
pub struct AppState {
    coordinator: ExecutionCoordinator,
    permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(coordinator: ExecutionCoordinator, max_concurrent_runs: usize) -> Self {
        Self {
            coordinator,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            ExecutionCoordinator::new(config.sandbox.clone()),
            config.server.max_concurrent_runs,
        )
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }
}

/// A pipeline error rendered as `{error: {kind, message, install?}}`
pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(error: SandboxError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_response())).into_response()
    }
}

fn invalid_body(rejection: JsonRejection) -> Response {
    let body = ErrorResponse::new(ErrorKind::InvalidInput, rejection.body_text());
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Largest request body accepted, leaving room for JSON escaping
fn body_limit(coordinator: &ExecutionCoordinator) -> usize {
    coordinator
        .config()
        .input
        .max_total_bytes
        .saturating_mul(2)
        .saturating_add(64 * 1024)
}

/// Create the service router
pub fn create_router(state: AppState) -> Router {
    let limit = body_limit(&state.coordinator);
    Router::new()
        .route("/health", get(handle_health))
        .route("/run", post(handle_run))
        .route("/run/stream", post(handle_run_stream))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves
pub async fn start_server(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state);

    let bind_addr = listener
        .local_addr()
        .context("Failed to obtain HTTP server bind address")?;
    info!("Starting runpad service on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    Ok(())
}

/// Run the service described by `config` until Ctrl-C
pub async fn serve(config: &AppConfig) -> Result<()> {
    let state = AppState::from_config(config);

    let swept = state
        .coordinator
        .workspaces()
        .sweep_stale(config.server.stale_workspace_age)
        .await;
    debug!(swept, "Stale workspace sweep finished");

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(
        interpreter = %config.sandbox.interpreter.program,
        workspace_root = %config.sandbox.workspace_root.display(),
        max_concurrent_runs = config.server.max_concurrent_runs,
        "Execution pipeline ready"
    );

    start_server(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    }
}

/// Handle GET /health
async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "runtime": state.coordinator.runtime_name(),
        "active_runs": state.coordinator.active_executions(),
    }))
}

/// Handle POST /run - execute and return the final result
async fn handle_run(
    State(state): State<AppState>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return invalid_body(rejection),
    };

    let _permit = match state.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return ApiError(SandboxError::Internal("service is shutting down".into())).into_response(),
    };

    match state
        .coordinator
        .execute(ExecutionRequest::from(request))
        .await
    {
        Ok(result) => Json(result.to_response()).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Handle POST /run/stream - execute and stream output as SSE
async fn handle_run_stream(
    State(state): State<AppState>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let Json(request) = body.map_err(invalid_body)?;

    let permit = state
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| {
            ApiError(SandboxError::Internal("service is shutting down".into())).into_response()
        })?;

    let mut execution = state
        .coordinator
        .execute_streaming(ExecutionRequest::from(request));
    debug!(execution_id = %execution.id(), "Streaming execution started");

    let stream = async_stream::stream! {
        let _permit = permit;

        while let Some(event) = execution.next_event().await {
            let payload = StreamEvent::Output {
                stream: event.stream,
                data: event.text().into_owned(),
            };
            yield Ok(sse_event(&payload));
        }

        let payload = match execution.finish().await {
            Ok(result) => StreamEvent::Result(result.to_response()),
            Err(e) => StreamEvent::Error(e.to_body()),
        };
        yield Ok(sse_event(&payload));
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn sse_event(payload: &StreamEvent) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|e| {
        json!({"event": "error", "kind": "internal", "message": e.to_string()}).to_string()
    });
    Event::default().event(payload.name()).data(data)
}

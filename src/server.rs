//! HTTP transport: a thin axum layer over [`Orchestrator`].
//!
//! | Route | Operation |
//! |-------|-----------|
//! | `GET  /health` | liveness |
//! | `POST /v1/convert/source` | synchronous conversion (202 + task on timeout) |
//! | `POST /v1/convert/source/async` | admission only |
//! | `POST /v1/convert/file` | multipart upload, synchronous |
//! | `POST /v1/convert/file/async` | multipart upload, admission only |
//! | `GET  /v1/status/poll/{task_id}?wait=` | long-poll |
//! | `GET  /v1/status/ws/{task_id}` | WebSocket subscription |
//! | `GET  /v1/result/{task_id}` | result (JSON or zip) |
//! | `POST /v1/callback/task/progress` | remote engine callbacks |
//! | `GET  /v1/clear/converters` | drop idle pipelines |
//! | `GET  /v1/clear/results?older_than=` | drop old results |
//! | `GET  /v1/stats` | diagnostics |
//!
//! The multipart routes take every uploaded file as a source and read the
//! conversion options from the remaining form fields, one field per option.
//! List options (`to_formats`, `from_formats`, `ocr_lang`, `page_range`) are
//! given by repeating the field. A field named `options` may instead carry
//! the whole options object as JSON; individual fields override it.

use crate::engine::ProgressCallback;
use crate::error::ServeError;
use crate::options::ConversionOptions;
use crate::orchestrator::{Orchestrator, SyncOutcome};
use crate::output::ResultBundle;
use crate::pipeline::source::{FileSource, HttpSource};
use crate::pipeline::DocumentSource;
use crate::task::{FailureKind, TaskEvent, TaskId, TaskSnapshot};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// State shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

// ── Request / response bodies ────────────────────────────────────────────

/// Body of both convert endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvertRequest {
    #[serde(default)]
    pub options: ConversionOptions,
    #[serde(default)]
    pub http_sources: Vec<HttpSource>,
    #[serde(default)]
    pub file_sources: Vec<FileSource>,
}

impl ConvertRequest {
    /// All sources, HTTP first, each group in request order.
    pub fn into_parts(self) -> (ConversionOptions, Vec<DocumentSource>) {
        let sources = self
            .http_sources
            .into_iter()
            .map(DocumentSource::Http)
            .chain(self.file_sources.into_iter().map(DocumentSource::File))
            .collect();
        (self.options, sources)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub status: String,
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Seconds to wait for a status change.
    #[serde(default)]
    pub wait: f64,
}

#[derive(Debug, Deserialize)]
pub struct ClearResultsQuery {
    #[serde(default = "default_older_than", alias = "older_then")]
    pub older_than: f64,
}

fn default_older_than() -> f64 {
    3600.0
}

fn seconds(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs.min(u32::MAX as f64))
    } else {
        Duration::ZERO
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

/// [`ServeError`] rendered as `{"detail": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub ServeError);

impl From<ServeError> for ApiError {
    fn from(e: ServeError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ServeError::Validation(_) | ServeError::InvalidProgress(_) => StatusCode::BAD_REQUEST,
            ServeError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::TaskNotFound { .. } | ServeError::ResultNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ServeError::ResultNotReady { .. } => StatusCode::CONFLICT,
            ServeError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = serde_json::json!({ "detail": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ───────────────────────────────────────────────────────────────

/// Build the API router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/convert/source", post(convert_source))
        .route("/v1/convert/source/async", post(convert_source_async))
        .route("/v1/convert/file", post(convert_file))
        .route("/v1/convert/file/async", post(convert_file_async))
        .route("/v1/status/poll/{task_id}", get(poll_status))
        .route("/v1/status/ws/{task_id}", get(status_ws))
        .route("/v1/result/{task_id}", get(task_result))
        .route("/v1/callback/task/progress", post(progress_callback))
        .route("/v1/clear/converters", get(clear_converters))
        .route("/v1/clear/results", get(clear_results))
        .route("/v1/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn start_server<F>(addr: &str, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

async fn convert_source(
    State(state): State<ApiState>,
    Json(request): Json<ConvertRequest>,
) -> ApiResult<Response> {
    let (options, sources) = request.into_parts();
    convert_and_wait(&state, options, sources).await
}

async fn convert_and_wait(
    state: &ApiState,
    options: ConversionOptions,
    sources: Vec<DocumentSource>,
) -> ApiResult<Response> {
    let outcome = state
        .orchestrator
        .convert_sync(options, sources, None)
        .await?;
    match outcome {
        SyncOutcome::Completed { bundle, .. } => bundle_response(&bundle),
        SyncOutcome::Failed { task, bundle } => {
            let timed_out = task
                .task_error
                .as_ref()
                .is_some_and(|f| f.kind == FailureKind::Timeout);
            match bundle {
                Some(bundle) if !timed_out => bundle_response(&bundle),
                _ => Ok(failed_task_response(task, timed_out)),
            }
        }
        SyncOutcome::Pending { task } => Ok((StatusCode::ACCEPTED, Json(task)).into_response()),
    }
}

fn failed_task_response(task: TaskSnapshot, timed_out: bool) -> Response {
    let status = if timed_out {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let detail = task
        .task_error
        .as_ref()
        .map_or_else(|| "Conversion failed".to_string(), |f| f.message.clone());
    (
        status,
        Json(serde_json::json!({ "detail": detail, "task": task })),
    )
        .into_response()
}

async fn convert_source_async(
    State(state): State<ApiState>,
    Json(request): Json<ConvertRequest>,
) -> ApiResult<Json<TaskSnapshot>> {
    let (options, sources) = request.into_parts();
    let task = state
        .orchestrator
        .submit(options, sources, crate::task::SubmitMode::Async)
        .await?;
    Ok(Json(task))
}

async fn convert_file(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let (options, sources) = read_upload(multipart).await?;
    convert_and_wait(&state, options, sources).await
}

async fn convert_file_async(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> ApiResult<Json<TaskSnapshot>> {
    let (options, sources) = read_upload(multipart).await?;
    let task = state
        .orchestrator
        .submit(options, sources, crate::task::SubmitMode::Async)
        .await?;
    Ok(Json(task))
}

/// Option fields given by repeating the form field.
const LIST_FIELDS: &[&str] = &["from_formats", "to_formats", "ocr_lang", "page_range"];
/// Option fields taken verbatim even when the value looks like a number.
const TEXT_FIELDS: &[&str] = &["md_page_break_placeholder"];

async fn read_upload(
    mut multipart: Multipart,
) -> Result<(ConversionOptions, Vec<DocumentSource>), ServeError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        ServeError::Validation(format!("invalid multipart body: {}", e.body_text()))
    };
    let mut sources = Vec::new();
    let mut fields = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let bytes = field.bytes().await.map_err(invalid)?;
                debug!("Upload {} ({} bytes)", filename, bytes.len());
                sources.push(DocumentSource::from_bytes(filename, &bytes));
            }
            None if name == "files" => {
                return Err(ServeError::Validation(
                    "uploaded files need a filename".into(),
                ))
            }
            None => fields.push((name, field.text().await.map_err(invalid)?)),
        }
    }
    Ok((options_from_form(fields)?, sources))
}

/// Assemble [`ConversionOptions`] from `(name, value)` form fields.
fn options_from_form(fields: Vec<(String, String)>) -> Result<ConversionOptions, ServeError> {
    use serde_json::{Map, Value};

    let mut object = Map::new();
    let mut given = Map::new();
    for (name, value) in fields {
        if name == "options" {
            let base: Map<String, Value> = serde_json::from_str(&value)
                .map_err(|e| ServeError::Validation(format!("options field: {e}")))?;
            object.extend(base);
        } else if LIST_FIELDS.contains(&name.as_str()) {
            let item = form_value(&name, &value);
            if let Value::Array(items) = given
                .entry(name)
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                items.push(item);
            }
        } else {
            let v = form_value(&name, &value);
            given.insert(name, v);
        }
    }
    object.extend(given);
    serde_json::from_value(Value::Object(object))
        .map_err(|e| ServeError::Validation(format!("invalid conversion options: {e}")))
}

/// A form value as JSON: booleans, numbers and inline JSON are decoded,
/// anything else stays a string.
fn form_value(name: &str, raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if TEXT_FIELDS.contains(&name) {
        return serde_json::Value::String(raw.to_string());
    }
    let looks_structured = matches!(trimmed, "true" | "false" | "null")
        || trimmed.starts_with(['{', '['])
        || trimmed.parse::<f64>().is_ok();
    if looks_structured {
        if let Ok(v) = serde_json::from_str(trimmed) {
            return v;
        }
    }
    serde_json::Value::String(raw.to_string())
}

async fn poll_status(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<TaskSnapshot>> {
    let id = TaskId::from(task_id);
    let snapshot = state.orchestrator.poll(&id, seconds(query.wait)).await?;
    Ok(Json(snapshot))
}

async fn status_ws(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let id = TaskId::from(task_id);
    ws.on_upgrade(move |socket| stream_task_events(socket, state, id))
}

async fn stream_task_events(socket: WebSocket, state: ApiState, id: TaskId) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = match state.orchestrator.subscribe(&id) {
        Ok(events) => events,
        Err(e) => {
            debug!("WebSocket for task {}: {}", id, e);
            let _ = send_event(&mut sender, &TaskEvent::error("Task not found.")).await;
            let _ = sender.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if send_event(&mut sender, &event).await.is_err() {
                    debug!("WebSocket for task {} closed by peer", id);
                    return;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sender.close().await;
}

async fn send_event<S>(sender: &mut S, event: &TaskEvent) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

async fn task_result(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let bundle = state.orchestrator.result(&TaskId::from(task_id))?;
    bundle_response(&bundle)
}

async fn progress_callback(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(callback): Json<ProgressCallback>,
) -> ApiResult<Response> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let ack = state.orchestrator.receive_progress(bearer, callback).await?;
    Ok(Json(ack).into_response())
}

async fn clear_converters(State(state): State<ApiState>) -> Json<ClearResponse> {
    Json(ClearResponse {
        status: "ok".into(),
        removed: state.orchestrator.clear_pipelines(),
    })
}

async fn clear_results(
    State(state): State<ApiState>,
    Query(query): Query<ClearResultsQuery>,
) -> Json<ClearResponse> {
    Json(ClearResponse {
        status: "ok".into(),
        removed: state.orchestrator.clear_results(seconds(query.older_than)),
    })
}

async fn stats(State(state): State<ApiState>) -> Json<crate::orchestrator::OrchestratorStats> {
    Json(state.orchestrator.stats())
}

/// JSON body for a single document, zip archive otherwise.
fn bundle_response(bundle: &ResultBundle) -> ApiResult<Response> {
    if let Some(single) = bundle.single_response() {
        return Ok(Json(single).into_response());
    }
    let zip = bundle.to_zip()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"converted_docs.zip\"",
            ),
        ],
        zip,
    )
        .into_response())
}

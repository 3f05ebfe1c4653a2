//! JSON HTTP API over the [`AppContext`] operations.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/collections` | Saved collections and the active one |
//! | `POST` | `/uploads` | Stage base64-encoded files for indexing |
//! | `POST` | `/index` | Start a background index job, returns `job_id` |
//! | `GET`  | `/index/{job_id}` | Job progress, report, and status text |
//! | `POST` | `/collections/{name}/select` | Activate a collection |
//! | `POST` | `/chat` | Run one chat turn |
//! | `GET`  | `/chat/{session_id}/history` | Visible history of a session |
//! | `POST` | `/chat/{session_id}/clear` | Clear history and agent memory |
//! | `POST` | `/temperature` | Change the active agent's temperature |
//! | `GET`  | `/tools/list` | Tools offered by the active agent |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "collection not found: q3" } }
//! ```
//!
//! Status codes: `bad_request` 400, `not_found` 404, `conflict` and
//! `no_active_agent` 409, `provider_error` 502, `busy` 503, `internal` 500.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser UI can be
//! served from anywhere.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::app::{AppContext, BatchReport, ChatReply, Selection, UploadedFile};
use crate::config::Config;
use crate::error::DocGraphError;
use crate::models::Turn;
use crate::progress::{IndexProgressEvent, RecordingProgress};
use crate::router::ToolEntry;
use crate::store::validate_name;

/// Shared state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    app: Arc<AppContext>,
    jobs: Arc<Mutex<JobTable>>,
}

struct IndexJob {
    collection: String,
    progress: Arc<RecordingProgress>,
    outcome: JobOutcome,
}

enum JobOutcome {
    Running,
    Finished(BatchReport),
    Failed(ErrorDetail),
}

/// Finished jobs kept for status polling; older ones are evicted.
const MAX_FINISHED_JOBS: usize = 32;

/// Index jobs by id. Running jobs are always kept; finished ones are kept
/// up to [`MAX_FINISHED_JOBS`], oldest evicted first.
#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, IndexJob>,
    finished: VecDeque<String>,
}

impl JobTable {
    fn insert(&mut self, id: String, job: IndexJob) {
        self.jobs.insert(id, job);
    }

    fn get(&self, id: &str) -> Option<&IndexJob> {
        self.jobs.get(id)
    }

    fn finish(&mut self, id: &str, outcome: JobOutcome) {
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        job.outcome = outcome;
        self.finished.push_back(id.to_string());
        while self.finished.len() > MAX_FINISHED_JOBS {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = Arc::new(AppContext::from_config(config.clone())?);
    app.init_storage().await?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("docgraph listening on http://{}", listener.local_addr()?);
    serve(listener, app).await
}

/// Serve the API on an already-bound listener.
///
/// If no collection is active yet, the first saved one is activated so chat
/// works right after a restart.
pub async fn serve(listener: tokio::net::TcpListener, app: Arc<AppContext>) -> anyhow::Result<()> {
    if let Some(collection) = app.activate_first_collection().await {
        tracing::info!(%collection, "active collection at startup");
    }
    axum::serve(listener, router(app)).await?;
    Ok(())
}

/// Build the route table.
pub fn router(app: Arc<AppContext>) -> Router {
    let state = AppState {
        app,
        jobs: Arc::new(Mutex::new(JobTable::default())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/collections", get(handle_list_collections))
        .route("/collections/{name}/select", post(handle_select))
        .route("/uploads", post(handle_upload))
        .route("/index", post(handle_start_index))
        .route("/index/{job_id}", get(handle_index_status))
        .route("/chat", post(handle_chat))
        .route("/chat/{session_id}/history", get(handle_history))
        .route("/chat/{session_id}/clear", post(handle_clear))
        .route("/temperature", post(handle_temperature))
        .route("/tools/list", get(handle_list_tools))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize, Clone)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DocGraphError> for AppError {
    fn from(err: DocGraphError) -> Self {
        let code = err.code();
        let status = match code {
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" | "no_active_agent" => StatusCode::CONFLICT,
            "busy" => StatusCode::SERVICE_UNAVAILABLE,
            "provider_error" => StatusCode::BAD_GATEWAY,
            "timeout" => StatusCode::REQUEST_TIMEOUT,
            "internal" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        if status.is_server_error() {
            tracing::error!(code, error = %err, "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Collections ============

#[derive(Serialize)]
struct CollectionsResponse {
    collections: Vec<String>,
    active: Option<String>,
}

async fn handle_list_collections(
    State(state): State<AppState>,
) -> Result<Json<CollectionsResponse>, AppError> {
    Ok(Json(CollectionsResponse {
        collections: state.app.list_collections().await?,
        active: state.app.active_collection(),
    }))
}

async fn handle_select(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Selection>, AppError> {
    Ok(Json(state.app.select_collection(&name).await?))
}

// ============ POST /uploads ============

#[derive(Deserialize)]
struct UploadRequest {
    files: Vec<UploadFileBody>,
}

#[derive(Deserialize)]
struct UploadFileBody {
    filename: String,
    content_base64: String,
}

#[derive(Serialize)]
struct UploadResponse {
    paths: Vec<String>,
}

async fn handle_upload(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, AppError> {
    if req.files.is_empty() {
        return Err(bad_request("files must not be empty"));
    }
    let mut files = Vec::with_capacity(req.files.len());
    for f in req.files {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(f.content_base64.trim())
            .map_err(|e| bad_request(format!("{}: invalid base64: {}", f.filename, e)))?;
        files.push(UploadedFile {
            filename: f.filename,
            bytes,
        });
    }
    let paths = state.app.upload(files).await?;
    Ok(Json(UploadResponse {
        paths: paths.iter().map(|p| p.display().to_string()).collect(),
    }))
}

// ============ Index jobs ============

#[derive(Deserialize)]
struct IndexRequest {
    collection: String,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    overlap: Option<usize>,
}

#[derive(Serialize)]
struct IndexStarted {
    job_id: String,
}

/// Validates the request, then runs the batch on its own task.
async fn handle_start_index(
    State(state): State<AppState>,
    Json(req): Json<IndexRequest>,
) -> Result<(StatusCode, Json<IndexStarted>), AppError> {
    let chunking = &state.app.config().chunking;
    let chunk_size = req.chunk_size.unwrap_or(chunking.chunk_size);
    let overlap = req.overlap.unwrap_or(chunking.overlap);
    validate_name(&req.collection)?;
    if chunk_size == 0 || overlap >= chunk_size {
        return Err(DocGraphError::InvalidChunking {
            chunk_size,
            overlap,
        }
        .into());
    }
    if state.app.pending_uploads().is_empty() {
        return Err(DocGraphError::NoDocuments.into());
    }

    let job_id = Uuid::new_v4().to_string();
    let progress = Arc::new(RecordingProgress::new());
    state.jobs.lock().unwrap_or_else(|e| e.into_inner()).insert(
        job_id.clone(),
        IndexJob {
            collection: req.collection.clone(),
            progress: progress.clone(),
            outcome: JobOutcome::Running,
        },
    );

    let app = state.app.clone();
    let jobs = state.jobs.clone();
    let id = job_id.clone();
    tokio::spawn(async move {
        let result = app
            .index_batch(chunk_size, overlap, &req.collection, progress.as_ref())
            .await;
        let outcome = match result {
            Ok(report) => JobOutcome::Finished(report),
            Err(e) => {
                tracing::warn!(job = %id, error = %e, "index job failed");
                JobOutcome::Failed(ErrorDetail {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
            }
        };
        jobs.lock()
            .unwrap_or_else(|e| e.into_inner())
            .finish(&id, outcome);
    });

    Ok((StatusCode::ACCEPTED, Json(IndexStarted { job_id })))
}

#[derive(Serialize)]
struct IndexStatus {
    job_id: String,
    collection: String,
    /// `running`, `done`, or `failed`.
    state: &'static str,
    events: Vec<IndexProgressEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<BatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetail>,
}

async fn handle_index_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<IndexStatus>, AppError> {
    let jobs = state.jobs.lock().unwrap_or_else(|e| e.into_inner());
    let job = jobs
        .get(&job_id)
        .ok_or_else(|| not_found(format!("no index job with id: {}", job_id)))?;

    let mut status = IndexStatus {
        job_id: job_id.clone(),
        collection: job.collection.clone(),
        state: "running",
        events: job.progress.events(),
        status_text: None,
        report: None,
        error: None,
    };
    match &job.outcome {
        JobOutcome::Running => {}
        JobOutcome::Finished(report) => {
            status.state = if report.collection_saved { "done" } else { "failed" };
            status.status_text = Some(report.status_text());
            status.report = Some(report.clone());
        }
        JobOutcome::Failed(error) => {
            status.state = "failed";
            status.status_text = Some(error.message.clone());
            status.error = Some(error.clone());
        }
    }
    Ok(Json(status))
}

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequestBody {
    #[serde(default = "default_session")]
    session_id: String,
    message: String,
}

fn default_session() -> String {
    "default".to_string()
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequestBody>,
) -> Result<Json<ChatReply>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    Ok(Json(state.app.chat(&req.session_id, &req.message).await?))
}

#[derive(Serialize)]
struct HistoryResponse {
    session_id: String,
    history: Vec<Turn>,
}

async fn handle_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    let history = state.app.history(&session_id);
    Json(HistoryResponse {
        session_id,
        history,
    })
}

async fn handle_clear(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    let history = state.app.clear_history(&session_id);
    Json(HistoryResponse {
        session_id,
        history,
    })
}

#[derive(Deserialize)]
struct TemperatureRequest {
    value: f32,
}

#[derive(Serialize)]
struct TemperatureResponse {
    temperature: f32,
}

async fn handle_temperature(
    State(state): State<AppState>,
    Json(req): Json<TemperatureRequest>,
) -> Result<Json<TemperatureResponse>, AppError> {
    let temperature = state.app.set_temperature(req.value).await?;
    Ok(Json(TemperatureResponse { temperature }))
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    collection: Option<String>,
    tools: Vec<ToolEntry>,
}

async fn handle_list_tools(
    State(state): State<AppState>,
) -> Result<Json<ToolListResponse>, AppError> {
    let tools = state.app.tools()?;
    Ok(Json(ToolListResponse {
        collection: state.app.active_collection(),
        tools,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(collection: &str) -> IndexJob {
        IndexJob {
            collection: collection.to_string(),
            progress: Arc::new(RecordingProgress::new()),
            outcome: JobOutcome::Running,
        }
    }

    fn failed() -> JobOutcome {
        JobOutcome::Failed(ErrorDetail {
            code: "no_documents".to_string(),
            message: "no documents".to_string(),
        })
    }

    #[test]
    fn finished_jobs_are_evicted_oldest_first() {
        let mut table = JobTable::default();
        table.insert("live".to_string(), running("c"));
        for i in 0..MAX_FINISHED_JOBS + 5 {
            let id = format!("job-{}", i);
            table.insert(id.clone(), running("c"));
            table.finish(&id, failed());
        }
        assert_eq!(table.len(), MAX_FINISHED_JOBS + 1);
        assert!(table.get("live").is_some());
        assert!(table.get("job-0").is_none());
        assert!(table.get(&format!("job-{}", MAX_FINISHED_JOBS + 4)).is_some());
    }

    #[test]
    fn finishing_unknown_job_is_ignored() {
        let mut table = JobTable::default();
        table.finish("ghost", failed());
        assert_eq!(table.len(), 0);
    }
}

//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/users/{user_id}/documents` | List the user's PDFs |
//! | `POST` | `/users/{user_id}/documents` | Upload PDFs (multipart field `documents`) and ingest |
//! | `GET`  | `/users/{user_id}/queries?count=N` | Recent queries, newest first |
//! | `POST` | `/users/{user_id}/queries` | Ask a question (`{"query_text": "..."}`) |
//! | `GET`  | `/users/{user_id}/queries/{query_id}` | One query record |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query_text must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use pdf_rag_core::models::QueryRecord;

use crate::loader::{sanitize_filename, validate_user, DocumentInfo, InvalidUser};
use crate::pipeline::{IngestSummary, Pipeline, QueryRejected};
use crate::s3;
use crate::worker::QueryDispatcher;

const UPLOAD_FIELD: &str = "documents";
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    dispatcher: QueryDispatcher,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, dispatcher: QueryDispatcher) -> Self {
        Self {
            pipeline,
            dispatcher,
        }
    }
}

/// The full router, without binding. Used by [`run_server`] and tests.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.pipeline.config().documents.max_upload_bytes;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/users/{user_id}/documents",
            get(handle_list_documents).post(handle_upload_documents),
        )
        .route(
            "/users/{user_id}/queries",
            get(handle_list_queries).post(handle_submit_query),
        )
        .route("/users/{user_id}/queries/{query_id}", get(handle_get_query))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind `[server].bind` and serve until the process is stopped.
///
/// In background query mode the worker loop is started first. Expired
/// query records are purged at startup and then hourly.
pub async fn run_server(pipeline: Pipeline) -> anyhow::Result<()> {
    let pipeline = Arc::new(pipeline);
    let server = pipeline.config().server.clone();

    tokio::spawn(purge_loop(Arc::clone(&pipeline)));

    let (dispatcher, _workers) =
        QueryDispatcher::start(server.query_mode, Arc::clone(&pipeline), server.workers);
    let app = build_router(AppState::new(pipeline, dispatcher));

    let listener = tokio::net::TcpListener::bind(&server.bind).await?;
    info!(bind = %server.bind, mode = ?server.query_mode, "HTTP server listening");
    println!("Listening on http://{}", server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn purge_loop(pipeline: Arc<Pipeline>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        match pipeline.purge_expired().await {
            Ok(0) => {}
            Ok(n) => info!(purged = n, "purged expired query records"),
            Err(e) => warn!(error = %e, "query purge failed"),
        }
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
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

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Validation failures become 400; everything else is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<InvalidUser>().is_some()
            || err.downcast_ref::<QueryRejected>().is_some()
        {
            return bad_request(err.to_string());
        }
        warn!(error = %err, "request failed");
        internal(err.to_string())
    }
}

impl From<InvalidUser> for AppError {
    fn from(err: InvalidUser) -> Self {
        bad_request(err.to_string())
    }
}

// ============ Record JSON ============

/// A query record as returned by the API.
#[derive(Serialize)]
pub struct QueryView {
    #[serde(flatten)]
    record: QueryRecord,
    is_complete: bool,
}

impl From<QueryRecord> for QueryView {
    fn from(record: QueryRecord) -> Self {
        let is_complete = record.is_complete();
        Self {
            record,
            is_complete,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /users/{user_id}/documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentInfo>,
}

/// Listing failures are logged and reported as an empty list.
async fn handle_list_documents(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<DocumentListResponse>, AppError> {
    validate_user(&user_id)?;

    let documents = match state.pipeline.list_documents(&user_id).await {
        Ok(docs) => docs,
        Err(e) => {
            warn!(user = %user_id, error = %e, "document listing failed");
            Vec::new()
        }
    };
    Ok(Json(DocumentListResponse { documents }))
}

#[derive(Serialize)]
struct UploadResponse {
    uploaded: Vec<String>,
    ingest: IngestSummary,
}

/// Every part is read and checked before anything is written, so a bad
/// part rejects the whole upload.
async fn handle_upload_documents(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    validate_user(&user_id)?;

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("each uploaded document needs a file name"))?;
        let name = sanitize_filename(&filename).map_err(|e| bad_request(e.to_string()))?;
        let bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
        files.push((name, bytes));
    }

    if files.is_empty() {
        return Err(bad_request(format!(
            "no files in multipart field '{}'",
            UPLOAD_FIELD
        )));
    }

    let config = state.pipeline.config();
    let mut uploaded = Vec::with_capacity(files.len());
    for (name, bytes) in files {
        let size = bytes.len();
        let name = state
            .pipeline
            .save_upload(&user_id, &name, bytes.clone())
            .await?;

        if let Some(ref s3_config) = config.documents.s3 {
            if let Err(e) = s3::upload(s3_config, &user_id, &name, &bytes).await {
                warn!(user = %user_id, file = %name, error = %e, "S3 mirror upload failed");
            }
        }
        info!(user = %user_id, file = %name, bytes = size, "document uploaded");
        uploaded.push(name);
    }

    let ingest = state.pipeline.ingest_user(&user_id, false).await?;
    Ok(Json(UploadResponse { uploaded, ingest }))
}

// ============ /users/{user_id}/queries ============

#[derive(Deserialize)]
struct ListParams {
    count: Option<usize>,
}

#[derive(Serialize)]
struct QueryListResponse {
    queries: Vec<QueryView>,
}

async fn handle_list_queries(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<QueryListResponse>, AppError> {
    let records = state.pipeline.list_queries(&user_id, params.count).await?;
    Ok(Json(QueryListResponse {
        queries: records.into_iter().map(QueryView::from).collect(),
    }))
}

#[derive(Deserialize)]
struct SubmitRequest {
    query_text: String,
}

async fn handle_submit_query(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<QueryView>, AppError> {
    let record = state.pipeline.submit(&user_id, &req.query_text).await?;
    let record = state.dispatcher.dispatch(&state.pipeline, record).await?;
    Ok(Json(record.into()))
}

async fn handle_get_query(
    State(state): State<AppState>,
    Path((user_id, query_id)): Path<(String, String)>,
) -> Result<Json<QueryView>, AppError> {
    state
        .pipeline
        .get_query(&user_id, &query_id)
        .await?
        .map(|record| Json(record.into()))
        .ok_or_else(|| not_found(format!("query not found: {}", query_id)))
}

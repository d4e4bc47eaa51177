//! HTTP API server.
//!
//! Exposes file management and question answering over a small JSON API.
//!
//! # Endpoints
//!
//! | Method   | Path            | Description                          |
//! |----------|-----------------|--------------------------------------|
//! | `GET`    | `/files`        | List ingested files                  |
//! | `PUT`    | `/files/{name}` | Upload and ingest a file (raw body)  |
//! | `DELETE` | `/files/{name}` | Delete a file everywhere             |
//! | `POST`   | `/query`        | Answer a question (streamed tokens)  |
//! | `GET`    | `/health`       | Health check (returns version)       |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::pipeline::{Answer, Pipeline, QueryOptions};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(bind_addr: &str, pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    pipeline.ensure_ready().await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/files", get(handle_list_files))
        .route("/files/{name}", put(handle_upload_file).delete(handle_delete_file))
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { pipeline });

    tracing::info!(%bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

/// Map pipeline errors to the most appropriate HTTP status.
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("unsupported") || msg.contains("not valid UTF-8") {
        bad_request(msg)
    } else {
        internal(msg)
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

// ============ GET /files ============

#[derive(Serialize)]
struct FileInfo {
    name: String,
    collection: String,
    created_at: i64,
}

#[derive(Serialize)]
struct FileListResponse {
    files: Vec<FileInfo>,
}

async fn handle_list_files(
    State(state): State<AppState>,
) -> Result<Json<FileListResponse>, AppError> {
    let files = state
        .pipeline
        .docstore()
        .list_files()
        .await
        .map_err(classify_error)?
        .into_iter()
        .map(|f| FileInfo {
            name: f.name,
            collection: f.collection,
            created_at: f.created_at,
        })
        .collect();
    Ok(Json(FileListResponse { files }))
}

// ============ PUT /files/{name} ============

#[derive(Serialize)]
struct UploadResponse {
    name: String,
    parents: usize,
    children: usize,
}

async fn handle_upload_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<UploadResponse>, AppError> {
    if name.trim().is_empty() {
        return Err(bad_request("file name must not be empty"));
    }
    if body.is_empty() {
        return Err(bad_request("file body must not be empty"));
    }

    let stats = state
        .pipeline
        .ingest_upload(&name, &body)
        .await
        .map_err(classify_error)?;

    Ok(Json(UploadResponse {
        name,
        parents: stats.parents,
        children: stats.children,
    }))
}

// ============ DELETE /files/{name} ============

async fn handle_delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .pipeline
        .delete_file(&name)
        .await
        .map_err(classify_error)?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("no file named: {}", name)))
    }
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    /// Optional per-query retrieval overrides (top_k, rerank_top_k,
    /// rerank, neighbors, relevance_gate).
    #[serde(flatten)]
    options: QueryOptions,
}

/// Answers stream as `text/plain` tokens. Cached and deflected answers
/// arrive as a single body; the `x-answer-source` header says which path
/// produced the response.
async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, AppError> {
    if request.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let answer = state
        .pipeline
        .answer(&request.question, &request.options)
        .await
        .map_err(classify_error)?;

    let response = match answer {
        Answer::Cached(text) => plain_response("cache", Body::from(text)),
        Answer::Deflected(text) => plain_response("deflected", Body::from(text)),
        Answer::Stream(rx) => {
            let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
                let item = rx.recv().await?;
                let chunk = item
                    .map(Bytes::from)
                    .map_err(|e| std::io::Error::other(e.to_string()));
                Some((chunk, rx))
            }));
            plain_response("llm", body)
        }
    };

    Ok(response)
}

fn plain_response(source: &str, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("x-answer-source", source)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

//! HTTP API server.
//!
//! Exposes document ingestion, job inspection, and the streaming chat
//! endpoint over JSON/SSE.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Register a document and enqueue ingestion |
//! | `DELETE` | `/documents/{id}` | Enqueue removal of a document |
//! | `GET`  | `/jobs/{id}` | Inspect an ingestion job |
//! | `POST` | `/chat` | Stream a retrieval-augmented completion (SSE) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses carry a machine-readable code and message:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! # Streaming
//!
//! `POST /chat` answers with `text/event-stream`. Each frame is either
//! `{"delta": "..."}` or `{"error": "..."}`; the stream always ends with a
//! `done` event. Frames are flushed as produced. Client disconnects cancel
//! the upstream completion request.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::context::assemble_context;
use crate::db;
use crate::ingest::{self, IngestPipeline};
use crate::migrate;
use crate::models::{JobKind, NewDocument, StreamEvent};
use crate::queue::{self, EnqueueOutcome, IngestQueue};
use crate::relay;
use crate::retrieve::Retriever;
use crate::store::{ScopeFilter, VectorStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    pipeline: Arc<IngestPipeline>,
    queue: Arc<IngestQueue>,
    retriever: Arc<Retriever>,
}

/// Start the API server: connects the database, runs idempotent
/// migrations, spawns the ingestion worker pool, and serves until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config).await?;
    migrate::run_migrations(&pool).await?;

    let store = Arc::new(VectorStore::new(pool.clone()));
    let pipeline = Arc::new(IngestPipeline::new(
        pool.clone(),
        Arc::clone(&store),
        Arc::clone(&config),
    ));
    let queue = IngestQueue::new(
        pool.clone(),
        config.queue.clone(),
        Arc::clone(&pipeline) as Arc<dyn queue::JobExecutor>,
    );
    let retriever = Arc::new(Retriever::new(Arc::clone(&store), Arc::clone(&config)));

    // Worker pool lives for the process; the sender is held so the
    // shutdown channel stays open.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _workers = queue.spawn_workers(shutdown_rx);

    let state = AppState {
        config,
        pool,
        pipeline,
        queue,
        retriever,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_upload_document))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
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

// ============ POST /documents ============

#[derive(Serialize)]
struct UploadResponse {
    document_id: String,
    /// `"queued"` for durable jobs, `"inline"` for the synchronous
    /// fallback when the queue backend is unreachable.
    mode: String,
    job_id: Option<String>,
    state: String,
    error: Option<String>,
}

async fn handle_upload_document(
    State(state): State<AppState>,
    Json(new_doc): Json<NewDocument>,
) -> Result<Json<UploadResponse>, AppError> {
    let doc = state
        .pipeline
        .register_document(new_doc)
        .await
        .map_err(|e| match &e {
            crate::error::PipelineError::InvalidInput(_) => bad_request(e.to_string()),
            _ => internal(e.to_string()),
        })?;

    let outcome = state
        .queue
        .enqueue(&doc.id, JobKind::Ingest, serde_json::json!({}))
        .await;

    let response = match outcome {
        EnqueueOutcome::Queued { job_id } => UploadResponse {
            document_id: doc.id,
            mode: "queued".to_string(),
            job_id: Some(job_id),
            state: "queued".to_string(),
            error: None,
        },
        EnqueueOutcome::Inline { result } => match result {
            Ok(()) => UploadResponse {
                document_id: doc.id,
                mode: "inline".to_string(),
                job_id: None,
                state: "completed".to_string(),
                error: None,
            },
            Err(e) => UploadResponse {
                document_id: doc.id,
                mode: "inline".to_string(),
                job_id: None,
                state: "failed".to_string(),
                error: Some(e.to_string()),
            },
        },
    };

    Ok(Json(response))
}

// ============ DELETE /documents/{id} ============

#[derive(Serialize)]
struct DeleteResponse {
    document_id: String,
    mode: String,
    job_id: Option<String>,
    state: String,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let doc = ingest::fetch_document(&state.pool, &id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found(format!("no document with id: {}", id)))?;

    let outcome = state
        .queue
        .enqueue(&doc.id, JobKind::Delete, serde_json::json!({}))
        .await;

    let response = match outcome {
        EnqueueOutcome::Queued { job_id } => DeleteResponse {
            document_id: doc.id,
            mode: "queued".to_string(),
            job_id: Some(job_id),
            state: "queued".to_string(),
        },
        EnqueueOutcome::Inline { result } => DeleteResponse {
            document_id: doc.id,
            mode: "inline".to_string(),
            job_id: None,
            state: if result.is_ok() { "completed" } else { "failed" }.to_string(),
        },
    };

    Ok(Json(response))
}

// ============ GET /jobs/{id} ============

#[derive(Serialize)]
struct JobResponse {
    id: String,
    document_id: String,
    kind: String,
    state: String,
    attempts: i64,
    last_error: Option<String>,
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job = queue::fetch_job(&state.pool, &id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found(format!("no job with id: {}", id)))?;

    Ok(Json(JobResponse {
        id: job.id,
        document_id: job.document_id,
        kind: job.kind.as_str().to_string(),
        state: job.state.as_str().to_string(),
        attempts: job.attempts,
        last_error: job.last_error,
    }))
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    owner_id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    message: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    if req.owner_id.trim().is_empty() {
        return Err(bad_request("owner_id must not be empty"));
    }

    let filter = ScopeFilter {
        owner: Some(req.owner_id),
        conversation: req.conversation_id,
    };

    // Best-effort retrieval: a degraded store or provider yields zero
    // chunks and the turn proceeds on the raw message.
    let k = state.retriever.default_k();
    let results = state.retriever.retrieve(&req.message, &filter, k).await;
    let context_block = assemble_context(&results, state.config.retrieval.context_budget_chars);

    let messages = relay::build_messages(&req.message, &context_block);
    let mut rx = relay::stream_completion(state.config.completion.clone(), messages);

    // Dropping this stream on client disconnect drops `rx`, which makes the
    // relay task's next send fail and cancels the upstream request.
    let sse_stream = stream! {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Delta(delta) => {
                    let payload = serde_json::json!({ "delta": delta });
                    yield Ok::<_, Infallible>(SseEvent::default().data(payload.to_string()));
                }
                StreamEvent::Error(message) => {
                    let payload = serde_json::json!({ "error": message });
                    yield Ok(SseEvent::default().event("error").data(payload.to_string()));
                    break;
                }
                StreamEvent::Done => {
                    yield Ok(SseEvent::default().event("done").data("[DONE]"));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

//! HTTP API.
//!
//! A thin JSON layer over [`App`]. The caller is identified by the
//! `x-user-id` header, which an upstream auth proxy is trusted to set.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/documents?filename=&format=` | Upload raw bytes and ingest |
//! | `GET`  | `/documents` | Caller's documents, newest first |
//! | `GET`  | `/documents/{id}` | Document status |
//! | `POST` | `/documents/{id}/retry` | Re-run a failed document |
//! | `DELETE` | `/documents/{id}` | Delete a document and its index |
//! | `POST` | `/sessions` | Create a chat session |
//! | `GET`  | `/sessions` | Caller's sessions |
//! | `GET`  | `/sessions/{id}/turns?limit=&skip=` | Session history |
//! | `POST` | `/sessions/{id}/turns` | Submit a message |
//! | `GET`  | `/quota/{user_id}` | Quota balance |
//! | `PUT`  | `/admin/quota/{user_id}` | Open an account |
//! | `POST` | `/admin/quota/{user_id}` | Adjust an allocation |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "quota_exceeded", "message": "..." } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `quota_exceeded` (402), `service_unavailable` (503),
//! `generation_failed` (502), `internal` (500).

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use docchat_core::models::{ChatSession, Document, DocumentFormat, Turn};
use docchat_core::quota::QuotaBalance;
use docchat_core::DocChatError;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app::App;
use crate::chat::{TurnOptions, TurnReply};

const USER_HEADER: &str = "x-user-id";

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "docchat server listening");
    axum::serve(listener, router(app)).await?;
    Ok(())
}

pub fn router(app: App) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = usize::try_from(app.config.ingest.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", post(handle_upload).get(handle_list_documents))
        .route(
            "/documents/{id}",
            get(handle_document_status).delete(handle_delete_document),
        )
        .route("/documents/{id}/retry", post(handle_retry_document))
        .route("/sessions", post(handle_create_session).get(handle_list_sessions))
        .route(
            "/sessions/{id}/turns",
            get(handle_history).post(handle_submit_turn),
        )
        .route("/quota/{user_id}", get(handle_balance))
        .route(
            "/admin/quota/{user_id}",
            post(handle_adjust_quota).put(handle_open_account),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(app)
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

impl From<DocChatError> for AppError {
    fn from(err: DocChatError) -> Self {
        let status = match &err {
            DocChatError::Validation(_) => StatusCode::BAD_REQUEST,
            DocChatError::NotFound(_) => StatusCode::NOT_FOUND,
            DocChatError::Conflict(_) => StatusCode::CONFLICT,
            DocChatError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            DocChatError::EmbeddingService(_)
            | DocChatError::EmbeddingRejected(_)
            | DocChatError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DocChatError::InvalidRequest(_) => StatusCode::BAD_GATEWAY,
            DocChatError::IndexCorruption(_) | DocChatError::Storage(_) => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn caller(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad_request(format!("missing {} header", USER_HEADER)))
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

// ============ Documents ============

#[derive(Deserialize)]
struct UploadParams {
    filename: String,
    /// Defaults to the filename's extension.
    format: Option<String>,
}

async fn handle_upload(
    State(app): State<App>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let owner = caller(&headers)?;
    let format = match params.format.as_deref() {
        Some(f) => f.parse::<DocumentFormat>()?,
        None => DocumentFormat::from_filename(&params.filename)?,
    };
    let doc = app
        .documents
        .ingest(body.to_vec(), format, &params.filename, &owner)
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn handle_list_documents(
    State(app): State<App>,
    headers: HeaderMap,
) -> Result<Json<Vec<Document>>, AppError> {
    let owner = caller(&headers)?;
    Ok(Json(app.documents.list(&owner).await?))
}

async fn owned_document(app: &App, id: &str, owner: &str) -> Result<Document, AppError> {
    let doc = app.documents.status(id).await?;
    if doc.owner_id != owner {
        return Err(DocChatError::NotFound(format!("document {}", id)).into());
    }
    Ok(doc)
}

async fn handle_document_status(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    let owner = caller(&headers)?;
    Ok(Json(owned_document(&app, &id, &owner).await?))
}

async fn handle_retry_document(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    let owner = caller(&headers)?;
    owned_document(&app, &id, &owner).await?;
    Ok(Json(app.documents.retry(&id).await?))
}

async fn handle_delete_document(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let owner = caller(&headers)?;
    app.documents.delete(&id, &owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Sessions ============

#[derive(Deserialize, Default)]
struct CreateSessionRequest {
    title: Option<String>,
    system_prompt: Option<String>,
}

async fn handle_create_session(
    State(app): State<App>,
    headers: HeaderMap,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<ChatSession>), AppError> {
    let owner = caller(&headers)?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let session = app
        .chat
        .create_session(&owner, req.title.as_deref(), req.system_prompt.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn handle_list_sessions(
    State(app): State<App>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSession>>, AppError> {
    let owner = caller(&headers)?;
    Ok(Json(app.chat.list_sessions(&owner).await?))
}

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
    #[serde(default)]
    skip: usize,
}

fn default_history_limit() -> usize {
    100
}

async fn handle_history(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Turn>>, AppError> {
    let owner = caller(&headers)?;
    Ok(Json(
        app.chat
            .history(&id, &owner, params.limit, params.skip)
            .await?,
    ))
}

#[derive(Deserialize)]
struct SubmitTurnRequest {
    text: String,
    #[serde(default = "default_use_rag")]
    use_rag: bool,
    system_prompt: Option<String>,
    k: Option<usize>,
}

fn default_use_rag() -> bool {
    true
}

async fn handle_submit_turn(
    State(app): State<App>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SubmitTurnRequest>,
) -> Result<Json<TurnReply>, AppError> {
    let owner = caller(&headers)?;
    if req.k == Some(0) {
        return Err(bad_request("k must be >= 1"));
    }
    let options = TurnOptions {
        use_rag: req.use_rag,
        system_prompt: req.system_prompt,
        k: req.k,
    };
    Ok(Json(
        app.chat.submit_turn(&id, &owner, &req.text, options).await?,
    ))
}

// ============ Quota ============

async fn handle_balance(
    State(app): State<App>,
    Path(user_id): Path<String>,
) -> Result<Json<QuotaBalance>, AppError> {
    Ok(Json(app.ledger.balance(&user_id).await?))
}

#[derive(Deserialize, Default)]
struct OpenAccountRequest {
    allocated: Option<i64>,
}

#[derive(Serialize)]
struct OpenAccountResponse {
    created: bool,
    balance: QuotaBalance,
}

async fn handle_open_account(
    State(app): State<App>,
    Path(user_id): Path<String>,
    body: Option<Json<OpenAccountRequest>>,
) -> Result<Json<OpenAccountResponse>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let created = app.ledger.open_account(&user_id, req.allocated).await?;
    let balance = app.ledger.balance(&user_id).await?;
    Ok(Json(OpenAccountResponse { created, balance }))
}

#[derive(Deserialize)]
struct AdjustRequest {
    delta: i64,
    reason: Option<String>,
}

async fn handle_adjust_quota(
    State(app): State<App>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(req): Json<AdjustRequest>,
) -> Result<Json<QuotaBalance>, AppError> {
    let admin = caller(&headers)?;
    Ok(Json(
        app.ledger
            .adjust_allocation(&user_id, req.delta, &admin, req.reason.as_deref())
            .await?,
    ))
}

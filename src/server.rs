//! Admin HTTP server.
//!
//! A thin JSON layer over [`ReleaseService`] for dashboards and scripts.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/environments` | Both environment rows |
//! | `POST` | `/environments/{env}/reset` | Return an environment to INACTIVE |
//! | `POST` | `/builds` | Start a build; answers `202` with the task id |
//! | `GET`  | `/builds/{id}` | Poll a build task |
//! | `POST` | `/promotions` | Promote staging to production |
//! | `GET`  | `/history` | Paged deployment history |
//! | `GET`  | `/history/{id}` | One history row |
//! | `GET`  | `/orphans` | Unreferenced managed resources |
//! | `DELETE` | `/orphans?confirm=true` | Delete them |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation_failed", "message": "staging must be ACTIVE to promote" } }
//! ```
//!
//! Validation and concurrent-build errors answer `409`, unknown resources
//! `404`, malformed input `400`, engine or alias failures `502`, everything
//! else `500`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use index_release_core::models::{
    BuildTask, DeploymentHistory, EnvironmentType, IndexEnvironment,
};

use crate::config::Config;
use crate::error::ReleaseError;
use crate::history::{HistoryFilter, HistoryPage, Page};
use crate::promotion::DeploymentOutcome;
use crate::reconcile::{DeletionReport, OrphanReport};
use crate::service::ReleaseService;

type AppState = Arc<ReleaseService>;

/// Starts the admin server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = ReleaseService::from_config(config).await?;
    let app = router(Arc::new(service));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "admin server listening");
    println!("Admin server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

/// All routes, with permissive CORS and request tracing.
pub fn router(service: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/environments", get(handle_environments))
        .route("/environments/{env}/reset", post(handle_reset))
        .route("/builds", post(handle_start_build))
        .route("/builds/{id}", get(handle_build_status))
        .route("/promotions", post(handle_promote))
        .route("/history", get(handle_history))
        .route("/history/{id}", get(handle_history_item))
        .route("/orphans", get(handle_orphans).delete(handle_delete_orphans))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
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

impl From<ReleaseError> for AppError {
    fn from(err: ReleaseError) -> Self {
        let status = match &err {
            ReleaseError::Validation(_) | ReleaseError::ConcurrentBuild { .. } => StatusCode::CONFLICT,
            ReleaseError::NotFound(_) => StatusCode::NOT_FOUND,
            ReleaseError::AliasUpdate(_) | ReleaseError::Transport(_) => StatusCode::BAD_GATEWAY,
            ReleaseError::Stage { .. } | ReleaseError::Database(_) | ReleaseError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
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

fn parse_environment(raw: &str) -> Result<EnvironmentType, AppError> {
    raw.parse::<EnvironmentType>()
        .map_err(|e| bad_request(e.to_string()))
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

// ============ Environments ============

async fn handle_environments(
    State(service): State<AppState>,
) -> Result<Json<Vec<IndexEnvironment>>, AppError> {
    Ok(Json(service.list_environments().await?))
}

async fn handle_reset(
    State(service): State<AppState>,
    Path(env): Path<String>,
) -> Result<Json<IndexEnvironment>, AppError> {
    let env = parse_environment(&env)?;
    Ok(Json(service.reset_environment(env).await?))
}

// ============ Builds ============

#[derive(Deserialize)]
struct StartBuildRequest {
    environment: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct StartBuildResponse {
    task_id: String,
    version: String,
    history_id: i64,
    environment: EnvironmentType,
}

/// The pipeline keeps running after the response; poll `/builds/{id}`.
async fn handle_start_build(
    State(service): State<AppState>,
    Json(req): Json<StartBuildRequest>,
) -> Result<(StatusCode, Json<StartBuildResponse>), AppError> {
    let env = parse_environment(&req.environment)?;
    let handle = service.start_build(env, req.description).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartBuildResponse {
            task_id: handle.task_id.clone(),
            version: handle.version.clone(),
            history_id: handle.history_id,
            environment: handle.environment,
        }),
    ))
}

async fn handle_build_status(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BuildTask>, AppError> {
    Ok(Json(service.build_status(&id).await?))
}

// ============ Promotions ============

#[derive(Deserialize, Default)]
struct PromoteRequest {
    #[serde(default)]
    description: Option<String>,
}

/// The body is optional; an empty request promotes without a description.
async fn handle_promote(
    State(service): State<AppState>,
    body: Bytes,
) -> Result<Json<DeploymentOutcome>, AppError> {
    let req: PromoteRequest = if body.is_empty() {
        PromoteRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid body: {}", e)))?
    };
    Ok(Json(service.promote(req.description).await?))
}

// ============ History ============

async fn handle_history(
    State(service): State<AppState>,
    Query(filter): Query<HistoryFilter>,
    Query(page): Query<Page>,
) -> Result<Json<HistoryPage>, AppError> {
    Ok(Json(service.list_history(&filter, page).await?))
}

async fn handle_history_item(
    State(service): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeploymentHistory>, AppError> {
    Ok(Json(service.get_history(id).await?))
}

// ============ Orphans ============

async fn handle_orphans(State(service): State<AppState>) -> Result<Json<OrphanReport>, AppError> {
    Ok(Json(service.find_orphans().await?))
}

#[derive(Deserialize)]
struct DeleteOrphansParams {
    #[serde(default)]
    confirm: bool,
}

async fn handle_delete_orphans(
    State(service): State<AppState>,
    Query(params): Query<DeleteOrphansParams>,
) -> Result<Json<DeletionReport>, AppError> {
    Ok(Json(service.delete_orphans(params.confirm).await?))
}

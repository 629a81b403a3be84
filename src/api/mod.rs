//! HTTP control surface.
//!
//! Every route maps to one [`Scheduler`] operation. Errors come back as
//! `{"error": "..."}` with a status derived from [`OrchestratorError`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::OrchestratorError;
use crate::metrics::{SchedulerMetrics, PROMETHEUS_CONTENT_TYPE};
use crate::scheduler::{FireDecision, JobDefinition, JobStatus, JobUpdate, ScheduledJob, Scheduler};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<SchedulerMetrics>,
}

pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

pub fn status_for(error: &OrchestratorError) -> StatusCode {
    match error {
        OrchestratorError::JobNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::JobAlreadyExists(_)
        | OrchestratorError::JobRunning(_)
        | OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
        OrchestratorError::Configuration(_)
        | OrchestratorError::UnknownDependency { .. }
        | OrchestratorError::DependencyCycle(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Store(_)
        | OrchestratorError::Lock(_)
        | OrchestratorError::Backend(_)
        | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    scheduler_running: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub scheduled: ScheduledJob,
    pub next_fire: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct JobListResponse {
    jobs: Vec<JobView>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct DispatchResponse {
    job_id: String,
    decision: FireDecision,
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: String,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler).post(create_job_handler))
        .route(
            "/jobs/{id}",
            get(get_job_handler)
                .put(update_job_handler)
                .delete(delete_job_handler),
        )
        .route("/jobs/{id}/retry", post(retry_job_handler))
        .route("/jobs/{id}/trigger", post(trigger_job_handler))
        .route("/stats", get(stats_handler))
        .route("/scheduler/status", get(scheduler_status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics.json", get(metrics_json_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn view(scheduler: &Scheduler, scheduled: ScheduledJob) -> JobView {
    let next_fire = scheduler.next_fire(scheduled.id());
    JobView {
        scheduled,
        next_fire,
    }
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        scheduler_running: state.scheduler.is_running(),
        timestamp: Utc::now(),
    })
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<JobListResponse>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let jobs = state.scheduler.list(status).await;
    let total = jobs.len();

    let jobs = jobs
        .into_iter()
        .skip(params.offset.unwrap_or(0))
        .take(params.limit.unwrap_or(100))
        .map(|scheduled| view(&state.scheduler, scheduled))
        .collect();
    Ok(Json(JobListResponse { jobs, total }))
}

async fn create_job_handler(
    State(state): State<ApiState>,
    Json(definition): Json<JobDefinition>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let job_id = definition.job_id.clone();
    state.scheduler.register_definition(definition).await?;
    let scheduled = state
        .scheduler
        .get(&job_id)
        .await
        .ok_or(OrchestratorError::JobNotFound(job_id))?;
    Ok((StatusCode::CREATED, Json(view(&state.scheduler, scheduled))))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let scheduled = state
        .scheduler
        .get(&id)
        .await
        .ok_or(OrchestratorError::JobNotFound(id))?;
    Ok(Json(view(&state.scheduler, scheduled)))
}

async fn update_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(update): Json<JobUpdate>,
) -> ApiResult<Json<JobView>> {
    let updated = state.scheduler.update(&id, update).await?;
    Ok(Json(view(&state.scheduler, updated)))
}

async fn delete_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    state.scheduler.unregister(&id).await?;
    Ok(Json(DeleteResponse { deleted: id }))
}

async fn retry_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<DispatchResponse>)> {
    let decision = state.scheduler.retry(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResponse {
            job_id: id,
            decision,
        }),
    ))
}

async fn trigger_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<DispatchResponse>)> {
    let decision = state.scheduler.trigger_now(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResponse {
            job_id: id,
            decision,
        }),
    ))
}

async fn stats_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.stats().await)
}

async fn scheduler_status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.status().await)
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.scheduler.stats().await;
    let job_counts = [
        (JobStatus::Pending, stats.pending),
        (JobStatus::Running, stats.running),
        (JobStatus::Retrying, stats.retrying),
        (JobStatus::Completed, stats.completed),
        (JobStatus::Failed, stats.failed),
    ];
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.snapshot().to_prometheus(&job_counts),
    )
}

async fn metrics_json_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

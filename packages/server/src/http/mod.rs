//! Thin HTTP admin/query shell: health check, on-demand trigger routes, and
//! the SSE stream. The ingestion and orchestration core lives in
//! [`crate::scheduler`], [`crate::session_poller`], and [`crate::queue`];
//! this module only exposes it over HTTP.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::servers::{Server, SyncStatus};
use crate::scheduler::Scheduler;
use crate::session_poller::PollerStatus;
use crate::sse::{stream_handler, SseBroadcaster, SseState};

const STALE_SYNC_THRESHOLD_MINUTES: i64 = 30;
const MAX_HEALTHY_QUEUED_JOBS: i64 = 100;
const MAX_HEALTHY_RECENT_FAILED_JOBS: i64 = 5;
const MAX_HEALTHY_TOTAL_FAILED_JOBS: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub scheduler: Arc<Scheduler>,
    pub poller_status: Arc<PollerStatus>,
    pub sse: SseState,
}

pub fn build_router(
    pool: PgPool,
    scheduler: Arc<Scheduler>,
    poller_status: Arc<PollerStatus>,
    broadcaster: Arc<SseBroadcaster>,
) -> Router {
    let state = AppState {
        pool,
        scheduler,
        poller_status,
        sse: SseState { broadcaster },
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods([Method::GET, Method::POST]);

    // The SSE route has its own narrower state; build it separately and
    // merge the fully-resolved sub-router in, rather than forcing every
    // other handler to carry an SseState field it doesn't need.
    let sse_router = Router::new().route("/events", get(stream_handler)).with_state(state.sse.clone());

    Router::new()
        .route("/health", get(health_handler))
        .route("/server-status", get(server_status_handler))
        .route("/servers/:server_id/sync/full", post(trigger_full_sync))
        .route("/servers/:server_id/sync/users", post(trigger_user_sync))
        .route("/servers/:server_id/sync/library-items", post(trigger_library_items_sync))
        .route("/servers/:server_id/sync/people", post(trigger_people_sync))
        .route("/servers/:server_id/sync/geolocation", post(trigger_geolocation_backfill))
        .with_state(state)
        .merge(sse_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => Json(HealthResponse { status: "ok" }).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "health check failed to reach the database");
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "unavailable" })).into_response()
        }
    }
}

#[derive(Serialize)]
struct TriggerResponse {
    job_id: Option<uuid::Uuid>,
}

async fn trigger_full_sync(State(state): State<AppState>, Path(server_id): Path<i64>) -> impl IntoResponse {
    respond(state.scheduler.trigger_full_sync(server_id).await)
}

async fn trigger_user_sync(State(state): State<AppState>, Path(server_id): Path<i64>) -> impl IntoResponse {
    respond(state.scheduler.trigger_user_sync(server_id).await)
}

async fn trigger_library_items_sync(State(state): State<AppState>, Path(server_id): Path<i64>) -> impl IntoResponse {
    respond(state.scheduler.trigger_library_items_sync(server_id).await)
}

async fn trigger_people_sync(State(state): State<AppState>, Path(server_id): Path<i64>) -> impl IntoResponse {
    respond(state.scheduler.trigger_people_sync(server_id).await)
}

async fn trigger_geolocation_backfill(State(state): State<AppState>, Path(server_id): Path<i64>) -> impl IntoResponse {
    respond(state.scheduler.trigger_geolocation_backfill(server_id).await)
}

#[derive(Serialize)]
struct ServerStatusEntry {
    id: i64,
    sync_status: SyncStatus,
    sync_progress: Option<String>,
    sync_error: Option<String>,
    last_sync_started: Option<DateTime<Utc>>,
    last_sync_completed: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct SessionPollerStatus {
    running: bool,
    success_rate: f64,
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
    last_cycle_duration_ms: i64,
}

#[derive(Serialize)]
struct QueueStatusSummary {
    queued_jobs: i64,
    recent_failed_jobs: i64,
    total_failed_jobs: i64,
}

#[derive(Serialize)]
struct ServerStatusResponse {
    status: &'static str,
    issues: Vec<String>,
    warnings: Vec<String>,
    servers: Vec<ServerStatusEntry>,
    session_poller: SessionPollerStatus,
    queue: QueueStatusSummary,
}

/// Aggregate `/server-status`: rolls up per-server sync state, the session
/// poller's health, and queue backlog/failure counts into a single
/// healthy/warning/unhealthy verdict.
async fn server_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    use std::sync::atomic::Ordering;

    let now = Utc::now();
    let stale_after = chrono::Duration::minutes(STALE_SYNC_THRESHOLD_MINUTES);

    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    let servers = match Server::find_all(&state.pool).await {
        Ok(servers) => servers,
        Err(err) => {
            tracing::error!(error = %err, "server-status failed to load servers");
            return (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    let mut entries = Vec::with_capacity(servers.len());
    for server in &servers {
        if server.sync_status == SyncStatus::Failed {
            issues.push(format!("server {} sync failed", server.id));
        }
        if server.is_stale_syncing(now, stale_after) {
            issues.push(format!("server {} is stuck syncing", server.id));
        }
        entries.push(ServerStatusEntry {
            id: server.id,
            sync_status: server.sync_status,
            sync_progress: server.sync_progress.clone(),
            sync_error: server.sync_error.clone(),
            last_sync_started: server.last_sync_started,
            last_sync_completed: server.last_sync_completed,
        });
    }

    let poller = &state.poller_status;
    if !poller.loop_running.load(Ordering::Relaxed) {
        issues.push("session poller is not running".to_string());
    } else if !poller.is_healthy() {
        warnings.push("session poller is degraded".to_string());
    }

    let session_poller = SessionPollerStatus {
        running: poller.loop_running.load(Ordering::Relaxed),
        success_rate: poller.success_rate(),
        consecutive_failures: poller.consecutive_failures.load(Ordering::Relaxed),
        last_success_at: *poller.last_success_at.lock().unwrap(),
        last_cycle_duration_ms: poller.last_cycle_duration_ms.load(Ordering::Relaxed),
    };

    let queue = match load_queue_status_summary(&state.pool).await {
        Ok(summary) => summary,
        Err(err) => {
            tracing::error!(error = %err, "server-status failed to load queue summary");
            QueueStatusSummary { queued_jobs: 0, recent_failed_jobs: 0, total_failed_jobs: 0 }
        }
    };

    if queue.queued_jobs > MAX_HEALTHY_QUEUED_JOBS {
        warnings.push(format!("{} jobs queued", queue.queued_jobs));
    }
    if queue.recent_failed_jobs > MAX_HEALTHY_RECENT_FAILED_JOBS {
        warnings.push(format!("{} jobs failed in the last hour", queue.recent_failed_jobs));
    }
    if queue.total_failed_jobs > MAX_HEALTHY_TOTAL_FAILED_JOBS {
        issues.push(format!("{} jobs currently in failed state", queue.total_failed_jobs));
    }

    let status = if !issues.is_empty() {
        "unhealthy"
    } else if !warnings.is_empty() {
        "warning"
    } else {
        "healthy"
    };

    Json(ServerStatusResponse {
        status,
        issues,
        warnings,
        servers: entries,
        session_poller,
        queue,
    })
    .into_response()
}

async fn load_queue_status_summary(pool: &PgPool) -> anyhow::Result<QueueStatusSummary> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE state IN ('created', 'retry')) AS queued_jobs,
            COUNT(*) FILTER (WHERE state = 'failed' AND completed_on > NOW() - INTERVAL '1 hour') AS recent_failed_jobs,
            COUNT(*) FILTER (WHERE state = 'failed') AS total_failed_jobs
        FROM jobs
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(QueueStatusSummary {
        queued_jobs: row.get("queued_jobs"),
        recent_failed_jobs: row.get("recent_failed_jobs"),
        total_failed_jobs: row.get("total_failed_jobs"),
    })
}

fn respond(result: crate::error::IngestResult<Option<uuid::Uuid>>) -> impl IntoResponse {
    match result {
        Ok(job_id) => Json(TriggerResponse { job_id }).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "trigger failed");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}

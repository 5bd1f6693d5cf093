//! Job service dashboard: worker pools, workers, queues and schedules.

use crate::error::{ProxyError, Result};
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobmonitor::{Queue, Schedule, Worker, WorkerPool};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobservice/pools", get(list_pools))
        .route("/jobservice/pools/:pool_id/workers", get(list_workers))
        .route("/jobservice/jobs/:job_id", put(stop_running_job))
        .route("/jobservice/queues", get(list_queues))
        .route("/jobservice/queues/:job_type", put(action_pending_jobs))
        .route("/schedules", get(list_schedules))
        .route("/schedules/:id", get(get_schedule).delete(delete_schedule))
        .route("/schedules/:id/paused", get(scheduler_status))
}

fn unix_time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerPoolResponse {
    pub pid: i64,
    pub worker_pool_id: String,
    pub host: String,
    pub concurrency: i64,
    pub start_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl From<WorkerPool> for WorkerPoolResponse {
    fn from(pool: WorkerPool) -> Self {
        Self {
            pid: pool.pid,
            worker_pool_id: pool.pool_id,
            host: pool.host,
            concurrency: pool.concurrency,
            start_at: unix_time(pool.start_at),
            heartbeat_at: unix_time(pool.heartbeat_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub pool_id: String,
    pub job_name: String,
    pub job_id: String,
    pub args: String,
    pub start_at: DateTime<Utc>,
    pub checkin_at: DateTime<Utc>,
}

impl From<Worker> for WorkerResponse {
    fn from(worker: Worker) -> Self {
        Self {
            id: worker.worker_id,
            pool_id: worker.pool_id,
            job_name: worker.job_name,
            job_id: worker.job_id,
            args: worker.args,
            start_at: unix_time(worker.started_at),
            checkin_at: unix_time(worker.check_in_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobQueueResponse {
    pub job_type: String,
    pub count: i64,
    pub latency: i64,
    pub paused: bool,
}

impl From<Queue> for JobQueueResponse {
    fn from(queue: Queue) -> Self {
        Self {
            job_type: queue.job_type,
            count: queue.count,
            latency: queue.latency,
            paused: queue.paused,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub id: i64,
    pub vendor_type: String,
    pub vendor_id: i64,
    pub cron: String,
    /// Extra attributes as a JSON string, empty when there are none
    pub extra_attrs: String,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl From<Schedule> for ScheduleResponse {
    fn from(schedule: Schedule) -> Self {
        let extra_attrs = match &schedule.extra_attrs {
            Some(attrs) => serde_json::to_string(attrs).unwrap_or_else(|e| {
                tracing::warn!(schedule_id = schedule.id, error = %e, "Failed to encode extra attributes");
                String::new()
            }),
            None => String::new(),
        };
        Self {
            id: schedule.id,
            vendor_type: schedule.vendor_type,
            vendor_id: schedule.vendor_id,
            cron: schedule.cron,
            extra_attrs,
            creation_time: schedule.creation_time,
            update_time: schedule.update_time,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerStatusResponse {
    pub paused: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
}

/// Actions accepted on a pending job queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueAction {
    Stop,
    Pause,
    Resume,
}

impl std::str::FromStr for QueueAction {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stop" => Ok(QueueAction::Stop),
            "pause" => Ok(QueueAction::Pause),
            "resume" => Ok(QueueAction::Resume),
            _ => Err(ProxyError::BadRequest("the action is not supported".to_string())),
        }
    }
}

/// GET /api/v2.0/jobservice/pools
async fn list_pools(State(state): State<AppState>) -> Result<Json<Vec<WorkerPoolResponse>>> {
    let pools = state.monitor.list_pools().await?;
    Ok(Json(pools.into_iter().map(Into::into).collect()))
}

/// GET /api/v2.0/jobservice/pools/{pool_id}/workers
async fn list_workers(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> Result<Json<Vec<WorkerResponse>>> {
    let workers = state.monitor.list_workers(&pool_id).await?;
    Ok(Json(workers.into_iter().map(Into::into).collect()))
}

/// PUT /api/v2.0/jobservice/jobs/{job_id}
async fn stop_running_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<ActionRequest>,
) -> Result<StatusCode> {
    if !request.action.eq_ignore_ascii_case("stop") {
        return Err(ProxyError::BadRequest("the action is not supported".to_string()));
    }
    tracing::info!(job_id = %job_id, "Stop running job requested");
    state.monitor.stop_running_job(&job_id).await?;
    Ok(StatusCode::OK)
}

/// GET /api/v2.0/jobservice/queues
async fn list_queues(State(state): State<AppState>) -> Result<Json<Vec<JobQueueResponse>>> {
    let queues = state.monitor.list_queues().await?;
    Ok(Json(queues.into_iter().map(Into::into).collect()))
}

/// PUT /api/v2.0/jobservice/queues/{job_type}
async fn action_pending_jobs(
    State(state): State<AppState>,
    Path(job_type): Path<String>,
    Json(request): Json<ActionRequest>,
) -> Result<StatusCode> {
    let job_type = job_type.to_uppercase();
    let action: QueueAction = request.action.parse()?;
    tracing::info!(job_type = %job_type, action = ?action, "Job queue action requested");
    match action {
        QueueAction::Stop => state.monitor.stop_pending_job(&job_type).await?,
        QueueAction::Pause => state.monitor.pause_job_queues(&job_type, true).await?,
        QueueAction::Resume => state.monitor.pause_job_queues(&job_type, false).await?,
    }
    Ok(StatusCode::OK)
}

/// GET /api/v2.0/schedules
async fn list_schedules(State(state): State<AppState>) -> Result<Json<Vec<ScheduleResponse>>> {
    let schedules = state.monitor.list_schedules().await?;
    Ok(Json(schedules.into_iter().map(Into::into).collect()))
}

/// GET /api/v2.0/schedules/{id}
async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ScheduleResponse>> {
    let schedule = state.monitor.get_schedule(id).await?;
    Ok(Json(schedule.into()))
}

/// DELETE /api/v2.0/schedules/{id}
async fn delete_schedule(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode> {
    state.monitor.delete_schedule(id).await?;
    Ok(StatusCode::OK)
}

/// GET /api/v2.0/schedules/{job_type}/paused
///
/// Only the scheduler's own flag is reported, whatever job type is named.
async fn scheduler_status(
    State(state): State<AppState>,
    Path(job_type): Path<String>,
) -> Result<Json<SchedulerStatusResponse>> {
    tracing::debug!(job_type = %job_type, "Scheduler status requested");
    let paused = state.monitor.scheduler_status().await?;
    Ok(Json(SchedulerStatusResponse { paused }))
}

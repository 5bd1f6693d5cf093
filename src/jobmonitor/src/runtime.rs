use crate::error::Result;
use async_trait::async_trait;

/// Heartbeat record a worker pool refreshes in the shared store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolHeartbeat {
    pub pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: i64,
    pub host: String,
    pub pid: i64,
    pub worker_ids: Vec<String>,
}

/// What a worker is doing right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerObservation {
    pub worker_id: String,
    pub is_busy: bool,
    pub job_name: String,
    pub job_id: String,
    pub started_at: i64,
    pub args: String,
    pub checkin: String,
    pub checkin_at: i64,
}

/// Pending queue of one job type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub job_name: String,
    pub count: i64,
    pub latency: i64,
}

/// Shared state of the distributed job runtime: pool heartbeats, worker observations,
/// pending queues and per-type paused markers.
#[async_trait]
pub trait WorkRuntime: Send + Sync {
    async fn pool_heartbeats(&self) -> Result<Vec<PoolHeartbeat>>;

    /// Observations for the given worker ids, in the same order
    async fn worker_observations(&self, worker_ids: &[String]) -> Result<Vec<WorkerObservation>>;

    async fn known_job_types(&self) -> Result<Vec<String>>;

    async fn queue_depths(&self) -> Result<Vec<QueueDepth>>;

    async fn paused_job_types(&self) -> Result<Vec<String>>;

    async fn set_paused(&self, job_type: &str, paused: bool) -> Result<()>;

    /// Read and delete the pending list of `job_type` in one atomic step,
    /// returning the job ids that were queued
    async fn drain_pending(&self, job_type: &str) -> Result<Vec<String>>;
}

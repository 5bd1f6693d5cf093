use serde::{Deserialize, Serialize};

/// Pool id meaning "every pool" for worker listings
pub const ALL: &str = "all";

/// Job type whose paused flag doubles as the global scheduler switch
pub const SCHEDULER_JOB_TYPE: &str = "SCHEDULER";

/// Snapshot of one worker pool, rebuilt from its heartbeat on every query.
/// Times are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    pub pool_id: String,
    pub pid: i64,
    pub start_at: i64,
    pub concurrency: i64,
    pub host: String,
    pub heartbeat_at: i64,
}

/// One worker as observed in the job runtime. An idle worker has empty job fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub pool_id: String,
    pub is_busy: bool,
    pub job_name: String,
    pub job_id: String,
    pub args: String,
    pub started_at: i64,
    pub check_in: String,
    pub check_in_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub job_type: String,
    pub count: i64,
    /// Seconds the oldest pending job has been waiting
    pub latency: i64,
    pub paused: bool,
}

//! In-process job runtime. Used when no Redis URL is configured and by tests.

use crate::error::Result;
use crate::runtime::{PoolHeartbeat, QueueDepth, WorkRuntime, WorkerObservation};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct PendingEntry {
    job_id: String,
    enqueued_at: i64,
}

#[derive(Default)]
struct State {
    pools: BTreeMap<String, PoolHeartbeat>,
    workers: HashMap<String, WorkerObservation>,
    known_jobs: BTreeSet<String>,
    /// Newest entry at the front
    pending: HashMap<String, VecDeque<PendingEntry>>,
    paused: BTreeSet<String>,
}

#[derive(Default)]
pub struct MemoryWorkRuntime {
    state: Mutex<State>,
}

impl MemoryWorkRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a pool heartbeat. Its job names become known job types.
    pub async fn heartbeat(&self, heartbeat: PoolHeartbeat) {
        let mut state = self.state.lock().await;
        state.known_jobs.extend(heartbeat.job_names.iter().cloned());
        state.pools.insert(heartbeat.pool_id.clone(), heartbeat);
    }

    pub async fn remove_pool(&self, pool_id: &str) {
        self.state.lock().await.pools.remove(pool_id);
    }

    /// Record what a worker is doing. An observation that is not busy clears it.
    pub async fn observe(&self, observation: WorkerObservation) {
        let mut state = self.state.lock().await;
        if observation.is_busy {
            state
                .workers
                .insert(observation.worker_id.clone(), observation);
        } else {
            state.workers.remove(&observation.worker_id);
        }
    }

    pub async fn register_job_type(&self, job_type: &str) {
        self.state.lock().await.known_jobs.insert(job_type.to_string());
    }

    pub async fn enqueue(&self, job_type: &str, job_id: &str, enqueued_at: i64) {
        let mut state = self.state.lock().await;
        state.known_jobs.insert(job_type.to_string());
        state
            .pending
            .entry(job_type.to_string())
            .or_default()
            .push_front(PendingEntry {
                job_id: job_id.to_string(),
                enqueued_at,
            });
    }

    pub async fn pending_count(&self, job_type: &str) -> usize {
        self.state
            .lock()
            .await
            .pending
            .get(job_type)
            .map_or(0, |q| q.len())
    }
}

#[async_trait]
impl WorkRuntime for MemoryWorkRuntime {
    async fn pool_heartbeats(&self) -> Result<Vec<PoolHeartbeat>> {
        Ok(self.state.lock().await.pools.values().cloned().collect())
    }

    async fn worker_observations(&self, worker_ids: &[String]) -> Result<Vec<WorkerObservation>> {
        let state = self.state.lock().await;
        Ok(worker_ids
            .iter()
            .map(|id| {
                state
                    .workers
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| WorkerObservation {
                        worker_id: id.clone(),
                        ..Default::default()
                    })
            })
            .collect())
    }

    async fn known_job_types(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.known_jobs.iter().cloned().collect())
    }

    async fn queue_depths(&self) -> Result<Vec<QueueDepth>> {
        let state = self.state.lock().await;
        let now = chrono::Utc::now().timestamp();
        Ok(state
            .known_jobs
            .iter()
            .map(|job_type| {
                let queue = state.pending.get(job_type);
                let latency = queue
                    .and_then(|q| q.back())
                    .filter(|oldest| oldest.enqueued_at > 0)
                    .map_or(0, |oldest| (now - oldest.enqueued_at).max(0));
                QueueDepth {
                    job_name: job_type.clone(),
                    count: queue.map_or(0, |q| q.len() as i64),
                    latency,
                }
            })
            .collect())
    }

    async fn paused_job_types(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().await.paused.iter().cloned().collect())
    }

    async fn set_paused(&self, job_type: &str, paused: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if paused {
            state.paused.insert(job_type.to_string());
        } else {
            state.paused.remove(job_type);
        }
        Ok(())
    }

    async fn drain_pending(&self, job_type: &str) -> Result<Vec<String>> {
        let drained = self
            .state
            .lock()
            .await
            .pending
            .remove(job_type)
            .unwrap_or_default();
        Ok(drained.into_iter().map(|e| e.job_id).collect())
    }
}

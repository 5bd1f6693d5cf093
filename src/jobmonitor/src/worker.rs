use crate::error::Result;
use crate::model::{Worker, ALL};
use crate::runtime::WorkRuntime;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct WorkerManager {
    runtime: Arc<dyn WorkRuntime>,
}

impl WorkerManager {
    pub fn new(runtime: Arc<dyn WorkRuntime>) -> Self {
        Self { runtime }
    }

    /// Workers of one pool, or of every pool when `pool_id` is `all`.
    ///
    /// The worker to pool mapping comes from the heartbeat records, so a worker
    /// whose pool stopped heartbeating is not listed.
    pub async fn list_workers(&self, pool_id: &str) -> Result<Vec<Worker>> {
        let heartbeats = self.runtime.pool_heartbeats().await?;
        let mut worker_pool: HashMap<String, String> = HashMap::new();
        let mut worker_ids = Vec::new();
        for hb in &heartbeats {
            for id in &hb.worker_ids {
                worker_pool.insert(id.clone(), hb.pool_id.clone());
                worker_ids.push(id.clone());
            }
        }

        let observations = self.runtime.worker_observations(&worker_ids).await?;
        Ok(observations
            .into_iter()
            .filter(|obs| {
                pool_id == ALL || worker_pool.get(&obs.worker_id).map(String::as_str) == Some(pool_id)
            })
            .map(|obs| Worker {
                pool_id: worker_pool.get(&obs.worker_id).cloned().unwrap_or_default(),
                worker_id: obs.worker_id,
                is_busy: obs.is_busy,
                job_name: obs.job_name,
                job_id: obs.job_id,
                args: obs.args,
                started_at: obs.started_at,
                check_in: obs.checkin,
                check_in_at: obs.checkin_at,
            })
            .collect())
    }
}

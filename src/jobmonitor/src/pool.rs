use crate::error::Result;
use crate::model::WorkerPool;
use crate::runtime::WorkRuntime;
use std::sync::Arc;

/// Lists worker pools from their live heartbeat records
#[derive(Clone)]
pub struct PoolManager {
    runtime: Arc<dyn WorkRuntime>,
}

impl PoolManager {
    pub fn new(runtime: Arc<dyn WorkRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn list(&self) -> Result<Vec<WorkerPool>> {
        let heartbeats = self.runtime.pool_heartbeats().await?;
        Ok(heartbeats
            .into_iter()
            .map(|hb| WorkerPool {
                pool_id: hb.pool_id,
                pid: hb.pid,
                start_at: hb.started_at,
                concurrency: hb.concurrency,
                host: hb.host,
                heartbeat_at: hb.heartbeat_at,
            })
            .collect())
    }
}

use crate::error::Result;
use crate::model::Queue;
use crate::runtime::WorkRuntime;
use std::sync::Arc;

#[derive(Clone)]
pub struct QueueManager {
    runtime: Arc<dyn WorkRuntime>,
}

impl QueueManager {
    pub fn new(runtime: Arc<dyn WorkRuntime>) -> Self {
        Self { runtime }
    }

    /// Pending queues of every known job type. `paused` is left false here; the
    /// paused markers are stored apart and joined by the caller.
    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        let depths = self.runtime.queue_depths().await?;
        Ok(depths
            .into_iter()
            .map(|d| Queue {
                job_type: d.job_name,
                count: d.count,
                latency: d.latency,
                paused: false,
            })
            .collect())
    }
}

use crate::error::Result;
use crate::runtime::WorkRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Pause, unpause and drain operations on the shared job queue namespace
#[derive(Clone)]
pub struct JobQueueClient {
    runtime: Arc<dyn WorkRuntime>,
}

impl JobQueueClient {
    pub fn new(runtime: Arc<dyn WorkRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn all_job_types(&self) -> Result<Vec<String>> {
        self.runtime.known_job_types().await
    }

    /// Job type to paused flag. Only paused types are present.
    pub async fn all_job_type_status(&self) -> Result<HashMap<String, bool>> {
        let paused = self.runtime.paused_job_types().await?;
        Ok(paused.into_iter().map(|t| (t, true)).collect())
    }

    pub async fn pause_job(&self, job_type: &str) -> Result<()> {
        info!(job_type = %job_type, "Pausing job type");
        self.runtime.set_paused(job_type, true).await
    }

    pub async fn unpause_job(&self, job_type: &str) -> Result<()> {
        info!(job_type = %job_type, "Unpausing job type");
        self.runtime.set_paused(job_type, false).await
    }

    /// Drain the pending queue of `job_type`, returning the drained job ids
    pub async fn stop_pending_jobs(&self, job_type: &str) -> Result<Vec<String>> {
        let job_ids = self.runtime.drain_pending(job_type).await?;
        info!(job_type = %job_type, count = job_ids.len(), "Job queue cleaned up");
        Ok(job_ids)
    }
}

use crate::client::JobQueueClient;
use crate::error::{MonitorError, Result};
use crate::model::{Queue, Worker, WorkerPool, ALL, SCHEDULER_JOB_TYPE};
use crate::pool::PoolManager;
use crate::queue::QueueManager;
use crate::runtime::WorkRuntime;
use crate::schedule::{Schedule, ScheduleManager};
use crate::task::{TaskField, TaskManager, TaskQuery, TaskStatus};
use crate::worker::WorkerManager;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pause, resume and stop control over the job runtime, keeping persisted task
/// state in line with what the runtime actually does. Holds no state of its own.
#[derive(Clone)]
pub struct MonitorController {
    pools: PoolManager,
    workers: WorkerManager,
    queues: QueueManager,
    client: JobQueueClient,
    tasks: Arc<dyn TaskManager>,
    schedules: Arc<dyn ScheduleManager>,
}

fn is_all(value: &str) -> bool {
    value.eq_ignore_ascii_case(ALL)
}

impl MonitorController {
    pub fn new(
        runtime: Arc<dyn WorkRuntime>,
        tasks: Arc<dyn TaskManager>,
        schedules: Arc<dyn ScheduleManager>,
    ) -> Self {
        Self {
            pools: PoolManager::new(runtime.clone()),
            workers: WorkerManager::new(runtime.clone()),
            queues: QueueManager::new(runtime.clone()),
            client: JobQueueClient::new(runtime),
            tasks,
            schedules,
        }
    }

    pub async fn list_pools(&self) -> Result<Vec<WorkerPool>> {
        self.pools.list().await
    }

    pub async fn list_workers(&self, pool_id: &str) -> Result<Vec<Worker>> {
        self.workers.list_workers(pool_id).await
    }

    /// Queues with their paused flag joined in from the paused markers
    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        let mut queues = self.queues.list_queues().await?;
        let status = self.client.all_job_type_status().await?;
        for queue in &mut queues {
            queue.paused = status.get(&queue.job_type).copied().unwrap_or(false);
        }
        Ok(queues)
    }

    /// Stop the task running `job_id`, or every running job when `job_id` is `all`.
    /// The batch stops at the first failure.
    pub async fn stop_running_job(&self, job_id: &str) -> Result<()> {
        if !is_all(job_id) {
            return self.stop_running(job_id).await;
        }
        let job_ids: Vec<String> = self
            .workers
            .list_workers(ALL)
            .await?
            .into_iter()
            .map(|w| w.job_id)
            .filter(|id| !id.is_empty())
            .collect();
        info!(count = job_ids.len(), "Stopping all running jobs");
        for id in &job_ids {
            self.stop_running(id).await?;
        }
        Ok(())
    }

    async fn stop_running(&self, job_id: &str) -> Result<()> {
        let tasks = self.tasks.list(&TaskQuery::job_id(job_id)).await?;
        match tasks.as_slice() {
            [] => {
                debug!(job_id = %job_id, "No task for job, nothing to stop");
                Ok(())
            }
            [task] => self.tasks.stop(task.id).await,
            _ => Err(MonitorError::DuplicateTasks {
                job_id: job_id.to_string(),
                count: tasks.len(),
            }),
        }
    }

    /// Drain the pending queue of `job_type` (every known type for `all`) and mark
    /// the drained jobs' tasks as stopped.
    ///
    /// The drain happens before the task update. If the process dies in between,
    /// the tasks are left pending and a repeated call reconciles nothing, so an
    /// operator sees them as pending rather than silently lost.
    pub async fn stop_pending_job(&self, job_type: &str) -> Result<()> {
        if !is_all(job_type) {
            return self.stop_pending(job_type).await;
        }
        for job_type in self.client.all_job_types().await? {
            self.stop_pending(&job_type).await?;
        }
        Ok(())
    }

    async fn stop_pending(&self, job_type: &str) -> Result<()> {
        let job_ids = self.client.stop_pending_jobs(job_type).await?;
        let mut updated = 0usize;
        for job_id in &job_ids {
            let tasks = self.tasks.list(&TaskQuery::job_id(job_id.as_str())).await?;
            let Some(mut task) = tasks.into_iter().next() else {
                continue;
            };
            if task.status.is_final() {
                continue;
            }
            task.status = TaskStatus::Stopped;
            task.end_time = Some(chrono::Utc::now());
            self.tasks
                .update(&task, &[TaskField::Status, TaskField::EndTime])
                .await?;
            updated += 1;
        }
        info!(
            job_type = %job_type,
            drained = job_ids.len(),
            updated,
            "Pending tasks stopped"
        );
        Ok(())
    }

    /// Pause or resume `job_type`, or every known type for `all`
    pub async fn pause_job_queues(&self, job_type: &str, pause: bool) -> Result<()> {
        if !is_all(job_type) {
            return self.set_paused(job_type, pause).await;
        }
        for job_type in self.client.all_job_types().await? {
            self.set_paused(&job_type, pause).await?;
        }
        Ok(())
    }

    async fn set_paused(&self, job_type: &str, pause: bool) -> Result<()> {
        if pause {
            self.client.pause_job(job_type).await
        } else {
            self.client.unpause_job(job_type).await
        }
    }

    /// Whether the scheduler is paused. The scheduler has no switch of its own;
    /// the `SCHEDULER` job type's paused marker is the switch.
    pub async fn scheduler_status(&self) -> Result<bool> {
        let status = self.client.all_job_type_status().await?;
        Ok(status.get(SCHEDULER_JOB_TYPE).copied().unwrap_or(false))
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.schedules.list().await
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Schedule> {
        self.schedules.get(id).await
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<()> {
        self.schedules.delete(id).await.inspect_err(|e| {
            warn!(schedule_id = id, error = %e, "Failed to delete schedule");
        })
    }
}

//! Persisted task records that the monitor keeps in line with the job runtime.

use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Success,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Stopped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Scheduled => "Scheduled",
            TaskStatus::Running => "Running",
            TaskStatus::Success => "Success",
            TaskStatus::Error => "Error",
            TaskStatus::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub execution_id: i64,
    pub job_id: String,
    pub status: TaskStatus,
    pub status_message: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(execution_id: i64, job_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: 0,
            execution_id,
            job_id: job_id.into(),
            status,
            status_message: String::new(),
            start_time: None,
            end_time: None,
            update_time: None,
        }
    }
}

/// Task filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub job_id: Option<String>,
    pub execution_id: Option<i64>,
}

impl TaskQuery {
    pub fn job_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn execution_id(execution_id: i64) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Default::default()
        }
    }

    fn matches(&self, task: &Task) -> bool {
        self.job_id.as_deref().map_or(true, |id| task.job_id == id)
            && self.execution_id.map_or(true, |id| task.execution_id == id)
    }
}

/// Fields `TaskManager::update` may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskField {
    Status,
    StatusMessage,
    StartTime,
    EndTime,
}

#[async_trait]
pub trait TaskManager: Send + Sync {
    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>>;

    async fn get(&self, id: i64) -> Result<Task>;

    /// Stop a task. Status, end time and update time change together or not at all.
    /// Stopping a task that already reached a final status is a no-op.
    async fn stop(&self, id: i64) -> Result<()>;

    /// Write the named fields of `task` to the persisted record with the same id
    async fn update(&self, task: &Task, fields: &[TaskField]) -> Result<()>;
}

#[derive(Default)]
struct TaskTable {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
}

/// Task store held in memory. A single lock covers each operation, so every
/// update is applied as one unit.
#[derive(Default)]
pub struct MemoryTaskManager {
    table: Mutex<TaskTable>,
}

impl MemoryTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a new task and return its id
    pub async fn create(&self, mut task: Task) -> i64 {
        let mut table = self.table.lock().await;
        table.next_id += 1;
        task.id = table.next_id;
        let now = Utc::now();
        task.start_time.get_or_insert(now);
        task.update_time = Some(now);
        table.tasks.insert(task.id, task);
        table.next_id
    }
}

#[async_trait]
impl TaskManager for MemoryTaskManager {
    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let table = self.table.lock().await;
        Ok(table
            .tasks
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Task> {
        self.table
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(format!("task {}", id)))
    }

    async fn stop(&self, id: i64) -> Result<()> {
        let mut table = self.table.lock().await;
        let task = table
            .tasks
            .get_mut(&id)
            .ok_or_else(|| MonitorError::NotFound(format!("task {}", id)))?;

        if task.status.is_final() {
            tracing::debug!(task_id = id, status = %task.status, "Task already finished, nothing to stop");
            return Ok(());
        }

        let now = Utc::now();
        task.status = TaskStatus::Stopped;
        task.end_time = Some(now);
        task.update_time = Some(now);
        tracing::info!(task_id = id, job_id = %task.job_id, "Task stopped");
        Ok(())
    }

    async fn update(&self, task: &Task, fields: &[TaskField]) -> Result<()> {
        let mut table = self.table.lock().await;
        let stored = table
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| MonitorError::NotFound(format!("task {}", task.id)))?;

        for field in fields {
            match field {
                TaskField::Status => stored.status = task.status,
                TaskField::StatusMessage => stored.status_message = task.status_message.clone(),
                TaskField::StartTime => stored.start_time = task.start_time,
                TaskField::EndTime => stored.end_time = task.end_time,
            }
        }
        stored.update_time = Some(Utc::now());
        Ok(())
    }
}

use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// Periodic job registered with the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub vendor_type: String,
    pub vendor_id: i64,
    pub cron: String,
    #[serde(default)]
    pub extra_attrs: Option<serde_json::Map<String, serde_json::Value>>,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[async_trait]
pub trait ScheduleManager: Send + Sync {
    async fn list(&self) -> Result<Vec<Schedule>>;

    async fn get(&self, id: i64) -> Result<Schedule>;

    async fn delete(&self, id: i64) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryScheduleManager {
    next_id: AtomicI64,
    schedules: RwLock<BTreeMap<i64, Schedule>>,
}

impl MemoryScheduleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schedule and return its id
    pub async fn create(
        &self,
        vendor_type: &str,
        vendor_id: i64,
        cron: &str,
        extra_attrs: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut schedules = self.schedules.write().await;
        let now = Utc::now();
        schedules.insert(
            id,
            Schedule {
                id,
                vendor_type: vendor_type.to_string(),
                vendor_id,
                cron: cron.to_string(),
                extra_attrs,
                creation_time: now,
                update_time: now,
            },
        );
        id
    }
}

#[async_trait]
impl ScheduleManager for MemoryScheduleManager {
    async fn list(&self) -> Result<Vec<Schedule>> {
        Ok(self.schedules.read().await.values().cloned().collect())
    }

    async fn get(&self, id: i64) -> Result<Schedule> {
        self.schedules
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(format!("schedule {}", id)))
    }

    async fn delete(&self, id: i64) -> Result<()> {
        match self.schedules.write().await.remove(&id) {
            Some(schedule) => {
                tracing::info!(schedule_id = id, vendor_type = %schedule.vendor_type, "Schedule deleted");
                Ok(())
            }
            None => Err(MonitorError::NotFound(format!("schedule {}", id))),
        }
    }
}

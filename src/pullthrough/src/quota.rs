use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::Mutex;

/// Resources a caller wants to reserve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceList {
    pub storage: i64,
}

impl ResourceList {
    pub fn storage(bytes: i64) -> Self {
        Self { storage: bytes }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    /// -1 means unlimited
    limit: i64,
    used: i64,
}

/// Per-project storage reservation. The work passed to [`QuotaController::request`]
/// only runs once the reservation is held; if it fails the reservation is refunded.
#[derive(Default)]
pub struct QuotaController {
    usage: Mutex<HashMap<i64, Usage>>,
}

impl QuotaController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_limit(&self, project_id: i64, limit: i64) {
        self.usage.lock().await.entry(project_id).or_default().limit = limit;
    }

    pub async fn used(&self, project_id: i64) -> i64 {
        self.usage
            .lock()
            .await
            .get(&project_id)
            .map(|u| u.used)
            .unwrap_or(0)
    }

    async fn reserve(&self, project_id: i64, resources: ResourceList) -> Result<()> {
        let mut usage = self.usage.lock().await;
        let entry = usage.entry(project_id).or_insert(Usage { limit: -1, used: 0 });
        if entry.limit >= 0 && entry.used + resources.storage > entry.limit {
            return Err(ProxyError::Quota(format!(
                "project {} storage {} + {} exceeds limit {}",
                project_id, entry.used, resources.storage, entry.limit
            )));
        }
        entry.used += resources.storage;
        Ok(())
    }

    async fn refund(&self, project_id: i64, resources: ResourceList) {
        let mut usage = self.usage.lock().await;
        if let Some(entry) = usage.get_mut(&project_id) {
            entry.used = (entry.used - resources.storage).max(0);
        }
    }

    pub async fn request<F, Fut>(&self, project_id: i64, resources: ResourceList, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.reserve(project_id, resources).await?;
        tracing::debug!(project_id = project_id, storage = resources.storage, "Quota reserved");

        if let Err(e) = f().await {
            self.refund(project_id, resources).await;
            tracing::debug!(project_id = project_id, storage = resources.storage, "Quota refunded");
            return Err(e);
        }
        Ok(())
    }
}

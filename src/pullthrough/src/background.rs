use std::future::Future;
use std::time::Duration;
use tokio_util::task::TaskTracker;

/// Supervisor for work detached from a request. Tasks never see the request's
/// cancellation; each one runs under its own timeout instead, and shutdown can
/// wait for the set to drain.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    pub fn spawn<F>(&self, name: &'static str, timeout: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            tracing::debug!(task = name, timeout_ms = timeout.as_millis() as u64, "Background task started");
            match tokio::time::timeout(timeout, task).await {
                Ok(()) => tracing::debug!(task = name, "Background task finished"),
                Err(_) => tracing::warn!(
                    task = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Background task hit its timeout and was dropped"
                ),
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every task spawned so far, then accept new ones again
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait up to `grace` for running tasks. Returns false when some were still
    /// running at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Background tasks still running at shutdown"
            );
        }
        drained
    }
}

use crate::config::{RegistryConfig, RegistryCredential, RegistryType};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Upstream registry endpoint with its last observed health
#[derive(Debug, Clone)]
pub struct Registry {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub registry_type: RegistryType,
    pub credential: Option<RegistryCredential>,
    pub insecure: bool,
    pub status: HealthStatus,
}

impl Registry {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl From<&RegistryConfig> for Registry {
    fn from(cfg: &RegistryConfig) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name.clone(),
            url: cfg.url.trim_end_matches('/').to_string(),
            registry_type: cfg.registry_type,
            credential: cfg.credential.clone(),
            insecure: cfg.insecure,
            // Until the first probe lands a configured registry is trusted
            status: HealthStatus::Healthy,
        }
    }
}

#[async_trait]
pub trait RegistryManager: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Registry>>;

    async fn list(&self) -> Result<Vec<Registry>>;

    async fn set_status(&self, id: i64, status: HealthStatus) -> Result<()>;
}

/// Registries loaded from configuration, health kept in memory
#[derive(Default)]
pub struct ConfiguredRegistries {
    registries: RwLock<HashMap<i64, Registry>>,
}

impl ConfiguredRegistries {
    pub fn new(configs: &[RegistryConfig]) -> Self {
        let registries = configs.iter().map(|c| (c.id, Registry::from(c))).collect();
        Self {
            registries: RwLock::new(registries),
        }
    }

    pub async fn insert(&self, registry: Registry) {
        self.registries.write().await.insert(registry.id, registry);
    }
}

#[async_trait]
impl RegistryManager for ConfiguredRegistries {
    async fn get(&self, id: i64) -> Result<Option<Registry>> {
        Ok(self.registries.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Registry>> {
        let mut all: Vec<Registry> = self.registries.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    async fn set_status(&self, id: i64, status: HealthStatus) -> Result<()> {
        if let Some(registry) = self.registries.write().await.get_mut(&id) {
            if registry.status != status {
                tracing::info!(
                    registry_id = id,
                    registry = %registry.name,
                    from = %registry.status,
                    to = %status,
                    "Registry health changed"
                );
            }
            registry.status = status;
        }
        Ok(())
    }
}

/// Periodically probes `GET <url>/v2/` on every registry
pub struct HealthChecker {
    manager: Arc<dyn RegistryManager>,
    client: Client,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(manager: Arc<dyn RegistryManager>, client: Client, interval: Duration) -> Self {
        Self {
            manager,
            client,
            interval,
        }
    }

    /// A registry answering 2xx or an auth challenge is reachable
    pub async fn probe(&self, registry: &Registry) -> HealthStatus {
        let url = format!("{}/v2/", registry.url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::UNAUTHORIZED => {
                HealthStatus::Healthy
            }
            Ok(resp) => {
                tracing::warn!(
                    registry_id = registry.id,
                    url = %url,
                    status = %resp.status(),
                    "Registry ping returned unexpected status"
                );
                HealthStatus::Unhealthy
            }
            Err(e) => {
                tracing::warn!(
                    registry_id = registry.id,
                    url = %url,
                    error = %e,
                    "Registry ping failed"
                );
                HealthStatus::Unhealthy
            }
        }
    }

    pub async fn check_all(&self) -> Result<()> {
        for registry in self.manager.list().await? {
            let status = self.probe(&registry).await;
            self.manager.set_status(registry.id, status).await?;
        }
        Ok(())
    }

    /// Probe until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.check_all().await {
                        tracing::warn!(error = %e, "Registry health check round failed");
                    }
                }
            }
        }
        tracing::debug!("Registry health checker stopped");
    }
}

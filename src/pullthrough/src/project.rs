use crate::config::ProjectConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Upstream registry proxied by this project. `None` for local-only projects.
    pub registry_id: Option<i64>,
    pub storage_limit: i64,
    pub max_upstream_connections: i32,
}

impl Project {
    pub fn is_proxy(&self) -> bool {
        matches!(self.registry_id, Some(id) if id > 0)
    }
}

impl From<&ProjectConfig> for Project {
    fn from(cfg: &ProjectConfig) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name.clone(),
            registry_id: cfg.registry_id,
            storage_limit: cfg.storage_limit,
            max_upstream_connections: cfg.max_upstream_connections,
        }
    }
}

#[async_trait]
pub trait ProjectManager: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Option<Project>>;

    async fn list(&self) -> Result<Vec<Project>>;
}

/// Projects fixed at startup from configuration
pub struct ConfiguredProjects {
    by_name: HashMap<String, Project>,
}

impl ConfiguredProjects {
    pub fn new(configs: &[ProjectConfig]) -> Self {
        Self {
            by_name: configs
                .iter()
                .map(|c| (c.name.clone(), Project::from(c)))
                .collect(),
        }
    }
}

#[async_trait]
impl ProjectManager for ConfiguredProjects {
    async fn get_by_name(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.by_name.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Project>> {
        let mut all: Vec<Project> = self.by_name.values().cloned().collect();
        all.sort_by_key(|p| p.id);
        Ok(all)
    }
}

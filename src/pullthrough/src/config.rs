use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Default Docker Hub registry URL
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Accept header sent upstream when pulling manifests.
/// Manifest list types come first so multi-arch images are resolved as indexes.
pub const DEFAULT_MANIFEST_ACCEPT_HEADER: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Default token expiry in seconds (5 minutes)
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;

/// Safety margin to subtract from token expiry (30 seconds)
pub const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// Dependency polling rounds for a single-platform manifest
pub const DEFAULT_MAX_WAIT: u32 = 10;

/// Multiplier on the sleep interval before an index is trimmed and pushed
pub const DEFAULT_MAX_MANIFEST_WAIT: u32 = 40;

/// Sleep between dependency polling rounds (20 seconds)
pub const DEFAULT_SLEEP_INTERVAL_MS: u64 = 20_000;

/// Pause after force-pushing missing blobs, before the final round (10 seconds)
pub const DEFAULT_FORCE_PUSH_PAUSE_MS: u64 = 10_000;

/// Expiry on upstream connection counters, guards against leaked permits
pub const UPSTREAM_CONN_COUNTER_TTL_SECS: u64 = 3600;

/// Default job service namespace in the shared queue store
pub const DEFAULT_JOB_NAMESPACE: &str = "harbor_job_service_namespace";

static DEFAULT_CONFIG: OnceLock<Config> = OnceLock::new();

/// Kind of upstream registry, selects the adapter built for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryType {
    /// Plain distribution-compatible registry
    #[default]
    DockerRegistry,
    /// Docker Hub: single-segment repositories live under `library/`
    DockerHub,
    /// Another Harbor instance
    Harbor,
}

impl<'de> serde::Deserialize<'de> for RegistryType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for RegistryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "docker-registry" => Ok(RegistryType::DockerRegistry),
            "docker-hub" => Ok(RegistryType::DockerHub),
            "harbor" => Ok(RegistryType::Harbor),
            _ => Err(format!(
                "unknown registry type `{}`, expected one of `docker-registry`, `docker-hub`, `harbor`",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    #[serde(default)]
    pub proxy: ProxyTiming,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the local registry storage
    pub directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Interval between registry health probes; 0 disables the checker
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: false,
            timeout_secs: default_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            registries: Vec::new(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub registry_type: RegistryType,
    #[serde(default)]
    pub credential: Option<RegistryCredential>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: i64,
    pub name: String,
    /// Upstream registry this project proxies; unset means local-only
    #[serde(default)]
    pub registry_id: Option<i64>,
    /// Storage quota in bytes, -1 for unlimited
    #[serde(default = "default_storage_limit")]
    pub storage_limit: i64,
    /// Concurrent upstream connections, <= 0 for unlimited
    #[serde(default)]
    pub max_upstream_connections: i32,
}

fn default_storage_limit() -> i64 {
    -1
}

/// Background reconciliation timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTiming {
    #[serde(default = "default_max_wait")]
    pub max_wait: u32,
    #[serde(default = "default_max_manifest_wait")]
    pub max_manifest_wait: u32,
    #[serde(default = "default_sleep_interval_ms")]
    pub sleep_interval_ms: u64,
    #[serde(default = "default_force_push_pause_ms")]
    pub force_push_pause_ms: u64,
}

fn default_max_wait() -> u32 {
    DEFAULT_MAX_WAIT
}

fn default_max_manifest_wait() -> u32 {
    DEFAULT_MAX_MANIFEST_WAIT
}

fn default_sleep_interval_ms() -> u64 {
    DEFAULT_SLEEP_INTERVAL_MS
}

fn default_force_push_pause_ms() -> u64 {
    DEFAULT_FORCE_PUSH_PAUSE_MS
}

impl Default for ProxyTiming {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            max_manifest_wait: DEFAULT_MAX_MANIFEST_WAIT,
            sleep_interval_ms: DEFAULT_SLEEP_INTERVAL_MS,
            force_push_pause_ms: DEFAULT_FORCE_PUSH_PAUSE_MS,
        }
    }
}

impl ProxyTiming {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn force_push_pause(&self) -> Duration {
        Duration::from_millis(self.force_push_pause_ms)
    }

    /// Fixed wait before an index is trimmed against local content
    pub fn index_wait(&self) -> Duration {
        self.sleep_interval() * self.max_manifest_wait
    }

    /// Upper bound for a single-manifest reconciliation task
    pub fn manifest_budget(&self) -> Duration {
        self.sleep_interval() * self.max_wait + self.force_push_pause()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Shared store URL; unset keeps counters and job state in process
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_job_namespace")]
    pub namespace: String,
}

fn default_job_namespace() -> String {
    DEFAULT_JOB_NAMESPACE.to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: default_job_namespace(),
        }
    }
}

impl Config {
    /// Build the default configuration directly in Rust code
    fn build_default() -> Config {
        Config {
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 5050,
            },
            storage: StorageConfig {
                directory: "cache/registry-proxy".to_string(),
            },
            upstream: UpstreamConfig {
                registries: vec![RegistryConfig {
                    id: 1,
                    name: "docker-hub".to_string(),
                    url: DEFAULT_REGISTRY_URL.to_string(),
                    registry_type: RegistryType::DockerHub,
                    credential: None,
                    insecure: false,
                }],
                ..UpstreamConfig::default()
            },
            projects: vec![
                ProjectConfig {
                    id: 1,
                    name: "library".to_string(),
                    registry_id: None,
                    storage_limit: -1,
                    max_upstream_connections: 0,
                },
                ProjectConfig {
                    id: 2,
                    name: "dockerhub-proxy".to_string(),
                    registry_id: Some(1),
                    storage_limit: -1,
                    max_upstream_connections: 0,
                },
            ],
            proxy: ProxyTiming::default(),
            redis: RedisConfig::default(),
        }
    }

    pub(crate) fn default_parsed() -> &'static Config {
        DEFAULT_CONFIG.get_or_init(Self::build_default)
    }

    /// Load a YAML configuration file and validate it
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|e| {
            ProxyError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut registry_ids = HashSet::new();
        for registry in &self.upstream.registries {
            if registry.id < 1 {
                return Err(ProxyError::Config(format!(
                    "registry `{}` must have a positive id",
                    registry.name
                )));
            }
            if !registry_ids.insert(registry.id) {
                return Err(ProxyError::Config(format!(
                    "duplicate registry id {}",
                    registry.id
                )));
            }
            if !registry.url.starts_with("http://") && !registry.url.starts_with("https://") {
                return Err(ProxyError::Config(format!(
                    "registry `{}` url must be http(s): {}",
                    registry.name, registry.url
                )));
            }
        }

        let mut project_names = HashSet::new();
        for project in &self.projects {
            if !project_names.insert(project.name.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate project name `{}`",
                    project.name
                )));
            }
            if let Some(id) = project.registry_id {
                if !registry_ids.contains(&id) {
                    return Err(ProxyError::Config(format!(
                        "project `{}` references unknown registry {}",
                        project.name, id
                    )));
                }
            }
        }

        if self.proxy.max_wait == 0 {
            return Err(ProxyError::Config("proxy.max_wait must be at least 1".to_string()));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_parsed().clone()
    }
}

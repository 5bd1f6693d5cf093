//! In-memory registry adapters shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use pullthrough::config::{ProjectConfig, RegistryConfig, RegistryType};
use pullthrough::error::{ProxyError, Result};
use pullthrough::project::Project;
use pullthrough::registry::adapter::{
    AdapterFactory, BlobOracle, BlobStream, LocalRegistry, PulledManifest, RegistryAdapter,
};
use pullthrough::registry::manifest::{digest_of, Descriptor, Manifest, MEDIA_TYPE_OCTET_STREAM};
use pullthrough::registry::{ConfiguredRegistries, Registry};
use pullthrough::ProxyTiming;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Millisecond timing so wait loops finish quickly
pub fn fast_timing() -> ProxyTiming {
    ProxyTiming {
        max_wait: 3,
        max_manifest_wait: 2,
        sleep_interval_ms: 10,
        force_push_pause_ms: 5,
    }
}

pub fn registry_config(id: i64) -> RegistryConfig {
    RegistryConfig {
        id,
        name: format!("upstream-{}", id),
        url: "https://registry.example.com".to_string(),
        registry_type: RegistryType::DockerRegistry,
        credential: None,
        insecure: false,
    }
}

pub fn proxy_project(id: i64, name: &str, registry_id: i64) -> Project {
    Project::from(&ProjectConfig {
        id,
        name: name.to_string(),
        registry_id: Some(registry_id),
        storage_limit: -1,
        max_upstream_connections: 0,
    })
}

pub fn local_project(id: i64, name: &str) -> Project {
    Project::from(&ProjectConfig {
        id,
        name: name.to_string(),
        registry_id: None,
        storage_limit: -1,
        max_upstream_connections: 0,
    })
}

pub fn registries(ids: &[i64]) -> Arc<ConfiguredRegistries> {
    let configs: Vec<RegistryConfig> = ids.iter().map(|id| registry_config(*id)).collect();
    Arc::new(ConfiguredRegistries::new(&configs))
}

/// Image manifest JSON over the given config and layers
pub fn image_manifest(config: &Descriptor, layers: &[Descriptor]) -> Bytes {
    let doc = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": config,
        "layers": layers,
    });
    Bytes::from(serde_json::to_vec(&doc).unwrap())
}

/// Manifest list JSON over the given children
pub fn manifest_list(children: &[Descriptor]) -> Bytes {
    let doc = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": children,
    });
    Bytes::from(serde_json::to_vec(&doc).unwrap())
}

pub fn blob_descriptor(data: &[u8]) -> Descriptor {
    Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest_of(data), data.len() as u64)
}

#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub media_type: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPush {
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

/// Registry held in memory. Serves as the upstream and as the local registry.
#[derive(Default)]
pub struct MemoryRegistry {
    manifests: Mutex<HashMap<String, StoredManifest>>,
    tags: Mutex<HashMap<(String, String), String>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    /// Digests present without content, for existence-only checks
    present: Mutex<HashSet<String>>,
    /// Digests whose existence check fails
    broken: Mutex<HashSet<String>>,
    pub manifest_pushes: Mutex<Vec<ManifestPush>>,
    pub blob_pushes: Mutex<Vec<(String, String)>>,
    pub manifest_pulls: AtomicUsize,
    pub blob_pulls: AtomicUsize,
    pub deleted_tags: Mutex<Vec<(String, String)>>,
    /// Delay applied to every manifest push
    pub push_delay: Mutex<Duration>,
    /// Delay applied to every blob pull
    pub pull_delay: Mutex<Duration>,
    /// Existence checks per digest
    pub exist_checks: Mutex<HashMap<String, usize>>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_manifest(&self, repository: &str, tag: &str, media_type: &str, payload: Bytes) -> String {
        let digest = digest_of(&payload);
        self.manifests.lock().unwrap().insert(
            digest.clone(),
            StoredManifest {
                media_type: media_type.to_string(),
                payload,
            },
        );
        if !tag.is_empty() {
            self.tags
                .lock()
                .unwrap()
                .insert((repository.to_string(), tag.to_string()), digest.clone());
        }
        digest
    }

    pub fn add_blob(&self, data: &[u8]) -> Descriptor {
        let desc = blob_descriptor(data);
        self.blobs
            .lock()
            .unwrap()
            .insert(desc.digest.clone(), Bytes::copy_from_slice(data));
        desc
    }

    pub fn add_blob_with_digest(&self, digest: &str, data: Bytes) {
        self.blobs.lock().unwrap().insert(digest.to_string(), data);
    }

    /// Mark a digest as present for existence checks only
    pub fn mark_present(&self, digest: &str) {
        self.present.lock().unwrap().insert(digest.to_string());
    }

    pub fn mark_broken(&self, digest: &str) {
        self.broken.lock().unwrap().insert(digest.to_string());
    }

    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock().unwrap() = delay;
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = delay;
    }

    pub fn exist_count(&self, digest: &str) -> usize {
        self.exist_checks.lock().unwrap().get(digest).copied().unwrap_or(0)
    }

    pub fn manifest_push_count(&self) -> usize {
        self.manifest_pushes.lock().unwrap().len()
    }

    pub fn blob_push_count(&self) -> usize {
        self.blob_pushes.lock().unwrap().len()
    }

    pub fn last_manifest_push(&self) -> Option<ManifestPush> {
        self.manifest_pushes.lock().unwrap().last().cloned()
    }

    pub fn manifest_payload(&self, digest: &str) -> Option<Bytes> {
        self.manifests
            .lock()
            .unwrap()
            .get(digest)
            .map(|m| m.payload.clone())
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(digest)
    }
}

#[async_trait]
impl RegistryAdapter for MemoryRegistry {
    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<PulledManifest> {
        self.manifest_pulls.fetch_add(1, Ordering::SeqCst);
        let digest = match self
            .tags
            .lock()
            .unwrap()
            .get(&(repository.to_string(), reference.to_string()))
        {
            Some(digest) => digest.clone(),
            None => reference.to_string(),
        };
        let stored = self
            .manifests
            .lock()
            .unwrap()
            .get(&digest)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("manifest {}:{}", repository, reference)))?;
        let manifest = Manifest::parse(Some(&stored.media_type), stored.payload)?;
        Ok(PulledManifest { manifest, digest })
    }

    async fn pull_blob(&self, _repository: &str, digest: &str) -> Result<(Descriptor, BlobStream)> {
        self.blob_pulls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("blob {}", digest)))?;
        let desc = Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, data.len() as u64);
        // Split into small chunks so the copy loop sees several reads
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(256)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok((desc, futures::stream::iter(chunks).boxed()))
    }

    async fn push_manifest(
        &self,
        repository: &str,
        tag: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<String> {
        let delay = *self.push_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let digest = self.add_manifest(repository, tag, media_type, payload);
        self.manifest_pushes.lock().unwrap().push(ManifestPush {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: digest.clone(),
        });
        Ok(digest)
    }

    async fn push_blob(&self, repository: &str, digest: &str, _size: u64, body: BlobStream) -> Result<()> {
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let data: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        self.add_blob_with_digest(digest, Bytes::from(data));
        self.blob_pushes
            .lock()
            .unwrap()
            .push((repository.to_string(), digest.to_string()));
        Ok(())
    }
}

#[async_trait]
impl BlobOracle for MemoryRegistry {
    async fn exist(&self, digest: &str, _project: Option<&str>) -> Result<bool> {
        *self
            .exist_checks
            .lock()
            .unwrap()
            .entry(digest.to_string())
            .or_insert(0) += 1;
        if self.broken.lock().unwrap().contains(digest) {
            return Err(ProxyError::Storage(format!("lookup of {} failed", digest)));
        }
        Ok(self.blobs.lock().unwrap().contains_key(digest)
            || self.manifests.lock().unwrap().contains_key(digest)
            || self.present.lock().unwrap().contains(digest))
    }
}

#[async_trait]
impl LocalRegistry for MemoryRegistry {
    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        self.tags
            .lock()
            .unwrap()
            .remove(&(repository.to_string(), tag.to_string()));
        self.deleted_tags
            .lock()
            .unwrap()
            .push((repository.to_string(), tag.to_string()));
        Ok(())
    }

    async fn stat_blob(&self, digest: &str) -> Result<Descriptor> {
        let size = self
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .map(|b| b.len() as u64)
            .ok_or_else(|| ProxyError::NotFound(format!("blob {}", digest)))?;
        Ok(Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, size))
    }
}

/// Hands out the same upstream adapter for every registry, or fails when asked to
pub struct StaticFactory {
    pub upstream: Arc<MemoryRegistry>,
    pub fail: bool,
}

impl StaticFactory {
    pub fn new(upstream: Arc<MemoryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            fail: false,
        })
    }

    pub fn failing(upstream: Arc<MemoryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            fail: true,
        })
    }
}

impl AdapterFactory for StaticFactory {
    fn create(&self, registry: &Registry) -> Result<Arc<dyn RegistryAdapter>> {
        if self.fail {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "no adapter for registry {}",
                registry.id
            )));
        }
        Ok(self.upstream.clone())
    }
}

use crate::error::Result;
use crate::registry::manager::Registry;
use crate::registry::manifest::{Descriptor, Manifest};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Streamed blob body as handed between adapters and the HTTP layer
pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Manifest pulled from a registry together with the digest the registry reported
#[derive(Debug, Clone)]
pub struct PulledManifest {
    pub manifest: Manifest,
    pub digest: String,
}

/// Pull/push capability over a registry endpoint. Remote registries and the local
/// store implement the same contract.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<PulledManifest>;

    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<(Descriptor, BlobStream)>;

    /// Returns the digest the registry stored the manifest under
    async fn push_manifest(
        &self,
        repository: &str,
        tag: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<String>;

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        body: BlobStream,
    ) -> Result<()>;
}

/// Answers whether content is already present locally
#[async_trait]
pub trait BlobOracle: Send + Sync {
    /// `project` scopes the lookup to blobs associated with that project
    async fn exist(&self, digest: &str, project: Option<&str>) -> Result<bool>;
}

/// The local registry: serves local pulls, receives mirrored content and answers existence
#[async_trait]
pub trait LocalRegistry: RegistryAdapter + BlobOracle {
    /// Remove a tag pointer. Missing tags are not an error.
    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()>;

    /// Descriptor of a locally stored blob without opening it
    async fn stat_blob(&self, digest: &str) -> Result<Descriptor>;
}

/// Builds the adapter for an upstream registry from its configuration
pub trait AdapterFactory: Send + Sync {
    fn create(&self, registry: &Registry) -> Result<Arc<dyn RegistryAdapter>>;
}

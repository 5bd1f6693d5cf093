use crate::cache::RegistryStorage;
use crate::error::{ProxyError, Result};
use crate::registry::adapter::{BlobOracle, BlobStream, LocalRegistry, PulledManifest, RegistryAdapter};
use crate::registry::manifest::{is_digest, Descriptor, Manifest, MEDIA_TYPE_OCTET_STREAM};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// Filesystem-backed local registry
#[derive(Clone)]
pub struct LocalRegistryStore {
    storage: Arc<RegistryStorage>,
}

/// First path segment of a repository is its project
pub fn project_of(repository: &str) -> &str {
    repository.split('/').next().unwrap_or(repository)
}

impl LocalRegistryStore {
    pub fn new(storage: Arc<RegistryStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<RegistryStorage> {
        &self.storage
    }

    async fn manifest_by_digest(&self, repository: &str, digest: &str) -> Result<PulledManifest> {
        let meta = self.storage.read_manifest_metadata(repository, digest).await?;
        if meta.is_none() && !self.storage.blob_exists(digest).await {
            return Err(ProxyError::NotFound(format!(
                "manifest {}@{}",
                repository, digest
            )));
        }
        let payload = self.storage.read_blob(digest).await?;
        // Content pushed under another repository of the project has no revision
        // metadata here, the payload carries its own media type
        let manifest = Manifest::parse(meta.as_ref().map(|m| m.media_type.as_str()), payload)?;
        Ok(PulledManifest {
            manifest,
            digest: digest.to_string(),
        })
    }
}

#[async_trait]
impl RegistryAdapter for LocalRegistryStore {
    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<PulledManifest> {
        if is_digest(reference) {
            return self.manifest_by_digest(repository, reference).await;
        }
        let mapping = self
            .storage
            .read_tag(repository, reference)
            .await?
            .ok_or_else(|| ProxyError::NotFound(format!("manifest {}:{}", repository, reference)))?;
        self.manifest_by_digest(repository, &mapping.digest).await
    }

    async fn pull_blob(&self, _repository: &str, digest: &str) -> Result<(Descriptor, BlobStream)> {
        let (size, file) = self.storage.open_blob(digest).await?;
        let desc = Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, size);
        Ok((desc, ReaderStream::new(file).boxed()))
    }

    async fn push_manifest(
        &self,
        repository: &str,
        tag: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<String> {
        let digest = self
            .storage
            .write_manifest(repository, tag, media_type, payload)
            .await?;
        self.storage.associate(project_of(repository), &digest).await?;
        Ok(digest)
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        body: BlobStream,
    ) -> Result<()> {
        if !self.storage.blob_exists(digest).await {
            let written = self.storage.write_blob_stream(digest, body).await?;
            if written != size {
                tracing::warn!(
                    repository = %repository,
                    digest = %digest,
                    expected = size,
                    written = written,
                    "Pushed blob size differs from descriptor"
                );
            }
        }
        self.storage.associate(project_of(repository), digest).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobOracle for LocalRegistryStore {
    async fn exist(&self, digest: &str, project: Option<&str>) -> Result<bool> {
        if !self.storage.blob_exists(digest).await {
            return Ok(false);
        }
        match project {
            Some(project) => Ok(self.storage.is_associated(project, digest).await),
            None => Ok(true),
        }
    }
}

#[async_trait]
impl LocalRegistry for LocalRegistryStore {
    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        if self.storage.delete_tag(repository, tag).await? {
            tracing::info!(repository = %repository, tag = %tag, "Removed stale local tag");
        }
        Ok(())
    }

    async fn stat_blob(&self, digest: &str) -> Result<Descriptor> {
        let size = self
            .storage
            .blob_size(digest)
            .await
            .ok_or_else(|| ProxyError::NotFound(format!("blob {}", digest)))?;
        Ok(Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, size))
    }
}

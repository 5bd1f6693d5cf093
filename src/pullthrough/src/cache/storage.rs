use crate::cache::metadata::{unix_now, ManifestMetadata, TagMapping};
use crate::error::{ProxyError, Result};
use crate::registry::manifest::digest_of;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Content-addressable storage backing the local registry.
///
/// Layout under the base directory:
/// - `blobs/sha256/<hex>`: layer, config and manifest payloads
/// - `manifests/<repository>/sha256/<hex>.json`: manifest revision metadata
/// - `manifests/<repository>/tags/<tag>.json`: tag pointers
/// - `projects/<project>/<hex>`: blob association markers
pub struct RegistryStorage {
    base_dir: PathBuf,
    blobs_dir: PathBuf,
    manifests_dir: PathBuf,
    projects_dir: PathBuf,
}

fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ProxyError::BadRequest(format!("invalid digest `{}`", digest)));
    }
    Ok(hex)
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\'));
    if bad {
        return Err(ProxyError::BadRequest(format!("invalid {} `{}`", kind, name)));
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("tmp.{}.{}", std::process::id(), seq))
}

impl RegistryStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let blobs_dir = base_dir.join("blobs").join("sha256");
        let manifests_dir = base_dir.join("manifests");
        let projects_dir = base_dir.join("projects");

        for dir in [&blobs_dir, &manifests_dir, &projects_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                ProxyError::Storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        Ok(Self {
            base_dir,
            blobs_dir,
            manifests_dir,
            projects_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blobs_dir.join(digest_hex(digest)?))
    }

    pub async fn blob_exists(&self, digest: &str) -> bool {
        match self.blob_path(digest) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn blob_size(&self, digest: &str) -> Option<u64> {
        let path = self.blob_path(digest).ok()?;
        fs::metadata(&path).await.ok().map(|m| m.len())
    }

    pub async fn read_blob(&self, digest: &str) -> Result<Bytes> {
        let path = self.blob_path(digest)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProxyError::NotFound(format!("blob {}", digest)))
            }
            Err(e) => Err(ProxyError::Storage(format!(
                "Failed to read blob {}: {}",
                digest, e
            ))),
        }
    }

    pub async fn open_blob(&self, digest: &str) -> Result<(u64, fs::File)> {
        let path = self.blob_path(digest)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProxyError::NotFound(format!("blob {}", digest)))
            }
            Err(e) => {
                return Err(ProxyError::Storage(format!(
                    "Failed to open blob {}: {}",
                    digest, e
                )))
            }
        };
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Stream a blob to disk (atomic write). sha256 digests are verified against the
    /// written bytes before the blob becomes visible.
    pub async fn write_blob_stream<S>(&self, digest: &str, mut stream: S) -> Result<u64>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let path = self.blob_path(digest)?;
        let temp_path = temp_sibling(&path);
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| ProxyError::Storage(format!("Failed to create blob file: {}", e)))?;

        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let copied: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(e) = copied {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ProxyError::Storage(format!(
                "Failed to write blob {}: {}",
                digest, e
            )));
        }

        if digest.starts_with("sha256:") {
            let actual = format!("sha256:{:x}", hasher.finalize());
            if actual != digest {
                let _ = fs::remove_file(&temp_path).await;
                tracing::warn!(
                    expected = %digest,
                    actual = %actual,
                    bytes = written,
                    "Rejected blob with mismatching digest"
                );
                return Err(ProxyError::Storage(format!(
                    "digest mismatch: expected {}, got {}",
                    digest, actual
                )));
            }
        }

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| ProxyError::Storage(format!("Failed to rename blob {}: {}", digest, e)))?;

        tracing::debug!(digest = %digest, bytes = written, "Blob written");
        Ok(written)
    }

    pub async fn write_blob(&self, digest: &str, data: Bytes) -> Result<u64> {
        self.write_blob_stream(digest, futures::stream::iter([Ok(data)]))
            .await
    }

    fn manifest_meta_path(&self, repository: &str, digest: &str) -> Result<PathBuf> {
        check_name("repository", repository)?;
        Ok(self
            .manifests_dir
            .join(repository)
            .join("sha256")
            .join(format!("{}.json", digest_hex(digest)?)))
    }

    fn tag_path(&self, repository: &str, tag: &str) -> Result<PathBuf> {
        check_name("repository", repository)?;
        if tag.is_empty() || tag.contains('/') || tag.starts_with('.') {
            return Err(ProxyError::BadRequest(format!("invalid tag `{}`", tag)));
        }
        Ok(self
            .manifests_dir
            .join(repository)
            .join("tags")
            .join(format!("{}.json", tag)))
    }

    fn marker_path(&self, project: &str, digest: &str) -> Result<PathBuf> {
        check_name("project", project)?;
        if project.contains('/') {
            return Err(ProxyError::BadRequest(format!("invalid project `{}`", project)));
        }
        Ok(self.projects_dir.join(project).join(digest_hex(digest)?))
    }

    async fn write_json_atomic<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ProxyError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let temp_path = temp_sibling(path);
        fs::write(&temp_path, serde_json::to_vec(value)?)
            .await
            .map_err(|e| ProxyError::Storage(format!("Failed to write {}: {}", temp_path.display(), e)))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| ProxyError::Storage(format!("Failed to rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Store a manifest payload and point `tag` at it. Returns the payload digest.
    pub async fn write_manifest(
        &self,
        repository: &str,
        tag: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<String> {
        let digest = digest_of(&payload);
        let size = payload.len() as u64;

        if !self.blob_exists(&digest).await {
            self.write_blob(&digest, payload).await?;
        }

        let meta = ManifestMetadata {
            digest: digest.clone(),
            media_type: media_type.to_string(),
            size,
            stored_at: unix_now(),
        };
        self.write_json_atomic(&self.manifest_meta_path(repository, &digest)?, &meta)
            .await?;

        let mapping = TagMapping {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: digest.clone(),
            updated_at: unix_now(),
        };
        self.write_json_atomic(&self.tag_path(repository, tag)?, &mapping)
            .await?;

        tracing::debug!(
            repository = %repository,
            tag = %tag,
            digest = %digest,
            media_type = %media_type,
            size = size,
            "Manifest stored"
        );
        Ok(digest)
    }

    pub async fn read_tag(&self, repository: &str, tag: &str) -> Result<Option<TagMapping>> {
        self.read_json(&self.tag_path(repository, tag)?).await
    }

    pub async fn read_manifest_metadata(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Option<ManifestMetadata>> {
        self.read_json(&self.manifest_meta_path(repository, digest)?)
            .await
    }

    /// Returns false when the tag did not exist
    pub async fn delete_tag(&self, repository: &str, tag: &str) -> Result<bool> {
        let path = self.tag_path(repository, tag)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProxyError::Storage(format!(
                "Failed to delete tag {}:{}: {}",
                repository, tag, e
            ))),
        }
    }

    pub async fn associate(&self, project: &str, digest: &str) -> Result<()> {
        let path = self.marker_path(project, digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, b"").await?;
        Ok(())
    }

    pub async fn is_associated(&self, project: &str, digest: &str) -> bool {
        match self.marker_path(project, digest) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

use crate::background::BackgroundTasks;
use crate::config::ProxyTiming;
use crate::error::{ProxyError, Result};
use crate::inflight::InflightSet;
use crate::limiter::{upstream_key, ConnectionLimiter, ConnectionPermit, MemoryCounterStore};
use crate::project::Project;
use crate::quota::{QuotaController, ResourceList};
use crate::registry::adapter::{AdapterFactory, BlobStream, LocalRegistry, RegistryAdapter};
use crate::registry::manager::{Registry, RegistryManager};
use crate::registry::manifest::{digest_of, is_digest, Descriptor, Manifest, ManifestIndex};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Allowance for the final manifest push once the dependency wait is over
const MANIFEST_PUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity of the requested artifact, taken from the request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub project_name: String,
    /// Full local repository name, project included
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

impl ArtifactInfo {
    /// `name` is the repository path after `/v2/`, `reference` a tag or digest
    pub fn parse(name: &str, reference: &str) -> Result<Self> {
        let name = name.trim_matches('/');
        let (project, rest) = name.split_once('/').ok_or_else(|| {
            ProxyError::NotFound(format!("repository `{}` has no project segment", name))
        })?;
        if project.is_empty() || rest.is_empty() {
            return Err(ProxyError::NotFound(format!("invalid repository `{}`", name)));
        }
        let (tag, digest) = if is_digest(reference) {
            (String::new(), reference.to_string())
        } else {
            (reference.to_string(), String::new())
        };
        Ok(Self {
            project_name: project.to_string(),
            repository: name.to_string(),
            tag,
            digest,
        })
    }

    /// Repository as known to the upstream registry
    pub fn upstream_repository(&self) -> &str {
        self.repository
            .strip_prefix(&self.project_name)
            .map(|r| r.trim_start_matches('/'))
            .unwrap_or(&self.repository)
    }

    pub fn reference(&self) -> &str {
        if self.digest.is_empty() {
            &self.tag
        } else {
            &self.digest
        }
    }
}

/// Manifest fetched from upstream, ready to be written to the client
#[derive(Debug, Clone)]
pub struct ProxiedManifest {
    pub media_type: String,
    pub digest: String,
    pub payload: Bytes,
}

/// Blob streamed from upstream
pub struct ProxiedBlob {
    pub descriptor: Descriptor,
    pub body: BlobStream,
}

/// Pull-through proxy controller.
///
/// Decides per request whether local content can serve it. Proxied manifests are
/// mirrored into the local registry by a background task that first waits for the
/// referenced blobs to land; proxied blobs are mirrored under a storage quota reservation.
#[derive(Clone)]
pub struct ProxyController {
    registries: Arc<dyn RegistryManager>,
    adapters: Arc<dyn AdapterFactory>,
    local: Arc<dyn LocalRegistry>,
    quota: Arc<QuotaController>,
    limiter: Arc<ConnectionLimiter>,
    inflight: InflightSet,
    tasks: BackgroundTasks,
    timing: ProxyTiming,
}

impl ProxyController {
    pub fn new(
        registries: Arc<dyn RegistryManager>,
        adapters: Arc<dyn AdapterFactory>,
        local: Arc<dyn LocalRegistry>,
        timing: ProxyTiming,
    ) -> Self {
        Self {
            registries,
            adapters,
            local,
            quota: Arc::new(QuotaController::new()),
            limiter: Arc::new(ConnectionLimiter::new(Arc::new(MemoryCounterStore::new()))),
            inflight: InflightSet::new(),
            tasks: BackgroundTasks::new(),
            timing,
        }
    }

    pub fn with_quota(mut self, quota: Arc<QuotaController>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<ConnectionLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_inflight(mut self, inflight: InflightSet) -> Self {
        self.inflight = inflight;
        self
    }

    pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn local(&self) -> &Arc<dyn LocalRegistry> {
        &self.local
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn inflight(&self) -> &InflightSet {
        &self.inflight
    }

    /// Upstream registry for a proxy project, if it is usable right now. Lookup
    /// failures, unhealthy registries and adapter construction errors all yield `None`.
    async fn healthy_upstream(&self, project: &Project) -> Option<Registry> {
        let id = project.registry_id.filter(|id| *id > 0)?;
        let registry = match self.registries.get(id).await {
            Ok(Some(registry)) => registry,
            Ok(None) => {
                tracing::warn!(project = %project.name, registry_id = id, "Proxy registry not found");
                return None;
            }
            Err(e) => {
                tracing::warn!(project = %project.name, registry_id = id, error = %e, "Proxy registry lookup failed");
                return None;
            }
        };
        if !registry.is_healthy() {
            tracing::debug!(project = %project.name, registry_id = id, status = %registry.status, "Proxy registry not healthy, serving locally");
            return None;
        }
        if let Err(e) = self.adapters.create(&registry) {
            tracing::warn!(registry_id = id, error = %e, "Cannot build upstream adapter, serving locally");
            return None;
        }
        Some(registry)
    }

    async fn upstream(&self, project: &Project) -> Result<(Registry, Arc<dyn RegistryAdapter>)> {
        let id = project
            .registry_id
            .filter(|id| *id > 0)
            .ok_or_else(|| ProxyError::UpstreamUnavailable(format!("project {} is not a proxy project", project.name)))?;
        let registry = self
            .registries
            .get(id)
            .await?
            .ok_or_else(|| ProxyError::UpstreamUnavailable(format!("registry {} not found", id)))?;
        let adapter = self
            .adapters
            .create(&registry)
            .map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
        Ok((registry, adapter))
    }

    async fn connection_permit(&self, project: &Project, registry: &Registry) -> Result<ConnectionPermit> {
        let key = upstream_key(registry.id);
        self.limiter
            .permit(&key, project.max_upstream_connections as i64)
            .await
            .ok_or_else(|| {
                tracing::warn!(
                    project = %project.name,
                    key = %key,
                    limit = project.max_upstream_connections,
                    "Upstream connection limit reached"
                );
                ProxyError::TooManyRequests(format!(
                    "too many concurrent connections to registry {}",
                    registry.name
                ))
            })
    }

    pub async fn use_local_manifest(&self, project: &Project, art: &ArtifactInfo) -> bool {
        if self.healthy_upstream(project).await.is_none() {
            return true;
        }
        if !art.digest.is_empty() {
            if let Ok(true) = self.local.exist(&art.digest, Some(&project.name)).await {
                return true;
            }
        }
        false
    }

    pub async fn use_local_blob(&self, project: &Project, digest: &str) -> bool {
        if self.healthy_upstream(project).await.is_none() {
            return true;
        }
        match self.local.exist(digest, Some(&project.name)).await {
            Ok(exist) => exist,
            Err(e) => {
                tracing::warn!(digest = %digest, error = %e, "Local blob existence check failed");
                false
            }
        }
    }

    async fn pull_upstream_manifest(&self, project: &Project, art: &ArtifactInfo) -> Result<(Arc<dyn RegistryAdapter>, ProxiedManifest, Manifest)> {
        let (registry, adapter) = self.upstream(project).await?;
        let permit = self.connection_permit(project, &registry).await?;
        let pulled = adapter
            .pull_manifest(art.upstream_repository(), art.reference())
            .await;
        permit.release().await;

        let pulled = match pulled {
            Ok(pulled) => pulled,
            Err(e) => {
                if e.is_not_found() && !art.tag.is_empty() {
                    self.spawn_tag_cleanup(art);
                }
                return Err(e);
            }
        };

        let digest = if art.digest.is_empty() {
            pulled.digest.clone()
        } else {
            art.digest.clone()
        };
        let proxied = ProxiedManifest {
            media_type: pulled.manifest.media_type().to_string(),
            digest,
            payload: pulled.manifest.payload().clone(),
        };
        Ok((adapter, proxied, pulled.manifest))
    }

    /// Fetch the manifest upstream for the client and mirror it locally in the background
    pub async fn proxy_manifest(&self, project: &Project, art: &ArtifactInfo) -> Result<ProxiedManifest> {
        let (adapter, proxied, manifest) = self.pull_upstream_manifest(project, art).await?;
        tracing::info!(
            project = %project.name,
            repository = %art.repository,
            reference = %art.reference(),
            digest = %proxied.digest,
            media_type = %proxied.media_type,
            "Proxied manifest from upstream"
        );

        let timeout = self.manifest_task_timeout(&manifest);
        let controller = self.clone();
        let project = project.clone();
        let art = art.clone();
        self.tasks.spawn("wait_and_push_manifest", timeout, async move {
            controller
                .wait_and_push_manifest(&project, &art, manifest, adapter)
                .await;
        });

        Ok(proxied)
    }

    /// Upstream manifest headers without mirroring
    pub async fn proxy_manifest_head(&self, project: &Project, art: &ArtifactInfo) -> Result<ProxiedManifest> {
        let (_, proxied, _) = self.pull_upstream_manifest(project, art).await?;
        Ok(proxied)
    }

    /// Bound for the dependency wait and force push phase only
    fn dependency_wait_budget(&self, manifest: &Manifest) -> Duration {
        let slack = self.timing.sleep_interval().max(Duration::from_secs(1)) * 2;
        match manifest {
            Manifest::Index(_) => self.timing.index_wait() + slack,
            Manifest::Image(_) => self.timing.manifest_budget() + slack,
        }
    }

    fn manifest_task_timeout(&self, manifest: &Manifest) -> Duration {
        self.dependency_wait_budget(manifest) + MANIFEST_PUSH_TIMEOUT
    }

    fn spawn_tag_cleanup(&self, art: &ArtifactInfo) {
        let local = self.local.clone();
        let repository = art.repository.clone();
        let tag = art.tag.clone();
        self.tasks.spawn("cleanup_local_tag", CLEANUP_TIMEOUT, async move {
            if let Err(e) = local.delete_tag(&repository, &tag).await {
                tracing::warn!(repository = %repository, tag = %tag, error = %e, "Failed to clean up stale local tag");
            }
        });
    }

    /// Reconcile dependencies of a proxied manifest, then push it to the local registry.
    /// Only the wait is bounded; an image manifest is pushed even when the wait runs out.
    /// Errors are logged; the client response is long gone.
    pub async fn wait_and_push_manifest(
        &self,
        project: &Project,
        art: &ArtifactInfo,
        manifest: Manifest,
        upstream: Arc<dyn RegistryAdapter>,
    ) {
        let budget = self.dependency_wait_budget(&manifest);
        let manifest = match manifest {
            Manifest::Index(index) => {
                let present = match tokio::time::timeout(budget, self.present_children(project, &index)).await {
                    Ok(present) => present,
                    Err(_) => {
                        tracing::warn!(repository = %art.repository, "Child manifest checks ran out of time, index not pushed");
                        return;
                    }
                };

                let trimmed = match index.retain(|d| present.contains(&d.digest)) {
                    Ok(Some(trimmed)) => trimmed,
                    Ok(None) => {
                        tracing::warn!(
                            repository = %art.repository,
                            tag = %art.tag,
                            children = index.manifests.len(),
                            "No child manifest is present locally, index not pushed"
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::error!(repository = %art.repository, error = %e, "Failed to trim manifest index");
                        return;
                    }
                };
                if trimmed.manifests.len() < index.manifests.len() {
                    tracing::info!(
                        repository = %art.repository,
                        kept = trimmed.manifests.len(),
                        dropped = index.manifests.len() - trimmed.manifests.len(),
                        "Trimmed manifest index to locally present children"
                    );
                }
                Manifest::Index(trimmed)
            }
            image @ Manifest::Image(_) => {
                let wait = self.wait_for_dependencies(project, art, &image, upstream);
                if tokio::time::timeout(budget, wait).await.is_err() {
                    tracing::warn!(
                        repository = %art.repository,
                        budget_ms = budget.as_millis() as u64,
                        "Dependency wait ran out of time, pushing manifest anyway"
                    );
                }
                image
            }
        };

        if let Err(e) = self
            .put_manifest_to_local_repo(&art.repository, &manifest, &art.tag)
            .await
        {
            tracing::error!(
                repository = %art.repository,
                tag = %art.tag,
                error = %e,
                "Failed to push manifest to local registry"
            );
        }
    }

    async fn present_children(&self, project: &Project, index: &ManifestIndex) -> HashSet<String> {
        // Children arrive through their own proxy requests
        tokio::time::sleep(self.timing.index_wait()).await;

        let mut present = HashSet::new();
        for child in &index.manifests {
            match self.local.exist(&child.digest, Some(&project.name)).await {
                Ok(true) => {
                    present.insert(child.digest.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(digest = %child.digest, error = %e, "Child manifest check failed");
                }
            }
        }
        present
    }

    /// Poll for missing references `max_wait` times, force pushing them from upstream
    /// before the last round
    async fn wait_for_dependencies(
        &self,
        project: &Project,
        art: &ArtifactInfo,
        image: &Manifest,
        upstream: Arc<dyn RegistryAdapter>,
    ) {
        let max_wait = self.timing.max_wait;
        let mut n = 0;
        while n < max_wait {
            tokio::time::sleep(self.timing.sleep_interval()).await;
            let missing = self.check_dependencies(project, image).await;
            if missing.is_empty() {
                break;
            }
            n += 1;
            tracing::debug!(
                repository = %art.repository,
                round = n,
                missing = missing.len(),
                "Manifest dependencies still missing"
            );
            if n + 1 == max_wait {
                tracing::info!(
                    repository = %art.repository,
                    missing = missing.len(),
                    "Pushing missing blobs to local registry directly"
                );
                for desc in &missing {
                    if let Err(e) = self
                        .push_blob_with_quota(project, art, desc, upstream.clone())
                        .await
                    {
                        tracing::error!(digest = %desc.digest, error = %e, "Failed to push missing blob");
                    }
                }
                tokio::time::sleep(self.timing.force_push_pause()).await;
            }
        }
    }

    /// Referenced descriptors not yet present locally
    pub async fn check_dependencies(&self, project: &Project, manifest: &Manifest) -> Vec<Descriptor> {
        let mut missing = Vec::new();
        for desc in manifest.references() {
            match self.local.exist(&desc.digest, Some(&project.name)).await {
                Ok(true) => {}
                Ok(false) => missing.push(desc),
                Err(e) => {
                    tracing::debug!(digest = %desc.digest, error = %e, "Dependency check failed");
                    missing.push(desc);
                }
            }
        }
        missing
    }

    /// Push at most once per `repository:tag` at a time. Returns false when another
    /// push for the same key was already running.
    pub async fn put_manifest_to_local_repo(
        &self,
        repository: &str,
        manifest: &Manifest,
        tag: &str,
    ) -> Result<bool> {
        let key = format!("{}:{}", repository, tag);
        let Some(_guard) = self.inflight.try_acquire(&key) else {
            tracing::debug!(key = %key, "Manifest push already in flight, skipping");
            return Ok(false);
        };

        let tag = if tag.is_empty() { "latest" } else { tag };
        let digest = self
            .local
            .push_manifest(repository, tag, manifest.media_type(), manifest.payload().clone())
            .await?;
        tracing::info!(
            repository = %repository,
            tag = %tag,
            digest = %digest,
            "Manifest pushed to local registry"
        );
        Ok(true)
    }

    /// Stream a blob from upstream to the client and mirror it locally afterwards
    pub async fn proxy_blob(&self, project: &Project, art: &ArtifactInfo, digest: &str) -> Result<ProxiedBlob> {
        let (registry, adapter) = self.upstream(project).await?;
        let permit = self.connection_permit(project, &registry).await?;
        let (mut desc, mut upstream_body) = match adapter
            .pull_blob(art.upstream_repository(), digest)
            .await
        {
            Ok(pulled) => pulled,
            Err(e) => {
                permit.release().await;
                return Err(e);
            }
        };
        if desc.digest != digest {
            tracing::warn!(requested = %digest, actual = %desc.digest, "Upstream blob digest differs from request");
            desc.digest = digest.to_string();
        }

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
        let controller = self.clone();
        let project = project.clone();
        let art = art.clone();
        let mut expected = desc.clone();
        tokio::spawn(async move {
            let mut copied = 0u64;
            let mut client_gone = false;
            let mut failed = false;
            while let Some(chunk) = upstream_body.next().await {
                match chunk {
                    Ok(bytes) => {
                        copied += bytes.len() as u64;
                        if tx.send(Ok(bytes)).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(digest = %expected.digest, error = %e, "Upstream blob stream failed");
                        let _ = tx.send(Err(e)).await;
                        failed = true;
                        break;
                    }
                }
            }
            drop(tx);
            permit.release().await;

            if client_gone {
                tracing::debug!(digest = %expected.digest, copied = copied, "Client went away during blob copy");
            } else if expected.size > 0 && copied != expected.size {
                tracing::error!(
                    digest = %expected.digest,
                    expected = expected.size,
                    actual = copied,
                    "Blob size mismatch after copy"
                );
            } else if expected.size == 0 && !failed {
                // Upstream sent no length; reserve what was actually copied
                expected.size = copied;
            }
            controller.spawn_blob_push(project, art, expected, adapter);
        });

        Ok(ProxiedBlob {
            descriptor: desc,
            body: tokio_stream::wrappers::ReceiverStream::new(rx).boxed(),
        })
    }

    /// Upstream blob descriptor without copying or mirroring the content
    pub async fn proxy_blob_head(&self, project: &Project, art: &ArtifactInfo, digest: &str) -> Result<Descriptor> {
        let (registry, adapter) = self.upstream(project).await?;
        let permit = self.connection_permit(project, &registry).await?;
        let pulled = adapter.pull_blob(art.upstream_repository(), digest).await;
        permit.release().await;
        let (mut desc, _body) = pulled?;
        desc.digest = digest.to_string();
        Ok(desc)
    }

    fn spawn_blob_push(&self, project: Project, art: ArtifactInfo, desc: Descriptor, upstream: Arc<dyn RegistryAdapter>) {
        let controller = self.clone();
        let timeout = self.timing.manifest_budget().max(Duration::from_secs(60));
        self.tasks.spawn("push_blob_to_local", timeout, async move {
            if let Err(e) = controller
                .push_blob_with_quota(&project, &art, &desc, upstream)
                .await
            {
                tracing::error!(
                    project = %project.name,
                    digest = %desc.digest,
                    error = %e,
                    "Error while putting blob to local"
                );
            }
        });
    }

    /// Mirror one blob into the project's local repository. The upstream pull and local
    /// write only happen inside an accepted storage reservation.
    pub async fn push_blob_with_quota(
        &self,
        project: &Project,
        art: &ArtifactInfo,
        desc: &Descriptor,
        upstream: Arc<dyn RegistryAdapter>,
    ) -> Result<()> {
        if self.local.exist(&desc.digest, Some(&project.name)).await? {
            tracing::debug!(digest = %desc.digest, "Blob already local, skipping push");
            return Ok(());
        }

        let upstream_repo = art.upstream_repository().to_string();
        let size = match desc.size {
            0 => {
                let (pulled, _body) = upstream.pull_blob(&upstream_repo, &desc.digest).await?;
                pulled.size
            }
            size => size,
        };
        if size == 0 && desc.digest != digest_of(&[]) {
            tracing::warn!(digest = %desc.digest, "Blob size unknown, not pushing without a storage reservation");
            return Ok(());
        }

        let local = self.local.clone();
        let local_repo = art.repository.clone();
        let resources = ResourceList::storage(size as i64);
        self.quota
            .request(project.id, resources, || async move {
                let (pulled, body) = upstream.pull_blob(&upstream_repo, &desc.digest).await?;
                if pulled.size > size {
                    return Err(ProxyError::Registry(format!(
                        "blob {} is {} bytes, {} were reserved",
                        desc.digest, pulled.size, size
                    )));
                }
                local.push_blob(&local_repo, &desc.digest, size, body).await?;
                tracing::info!(
                    repository = %local_repo,
                    digest = %desc.digest,
                    size = size,
                    "Blob pushed to local registry"
                );
                Ok(())
            })
            .await
    }
}

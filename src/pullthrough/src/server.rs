use crate::api;
use crate::background::BackgroundTasks;
use crate::cache::RegistryStorage;
use crate::config::{Config, RedisConfig};
use crate::controller::{ArtifactInfo, ProxiedManifest, ProxyController};
use crate::error::{ProxyError, Result};
use crate::inflight::InflightSet;
use crate::limiter::{ConnectionLimiter, CounterStore, MemoryCounterStore, RedisCounterStore};
use crate::project::{ConfiguredProjects, Project, ProjectManager};
use crate::quota::QuotaController;
use crate::registry::{
    BlobStream, ConfiguredRegistries, Descriptor, HealthChecker, LocalRegistryStore,
    UpstreamAdapterFactory,
};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use jobmonitor::{
    MemoryScheduleManager, MemoryTaskManager, MemoryWorkRuntime, MonitorController,
    RedisWorkRuntime, WorkRuntime,
};
use redis::aio::ConnectionManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

/// How long shutdown waits for in-flight mirroring
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub controller: ProxyController,
    pub projects: Arc<dyn ProjectManager>,
    pub monitor: MonitorController,
}

impl AppState {
    async fn project(&self, name: &str) -> Result<Project> {
        self.projects
            .get_by_name(name)
            .await?
            .ok_or_else(|| ProxyError::NotFound(format!("project {}", name)))
    }
}

/// Registry API request parsed from a `/v2/...` path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V2Request {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
}

/// Split a `/v2/` path into repository name and reference. Repository names
/// contain slashes, so the last `/manifests/` or `/blobs/` segment decides.
pub fn parse_v2_path(path: &str) -> Option<V2Request> {
    const V2_PREFIX: &str = "/v2/";
    const MANIFESTS_SEGMENT: &str = "/manifests/";
    const BLOBS_SEGMENT: &str = "/blobs/";

    let rest = format!("/{}", path.strip_prefix(V2_PREFIX)?);

    if let Some((name, reference)) = split_last(&rest, MANIFESTS_SEGMENT) {
        return Some(V2Request::Manifest { name, reference });
    }
    if let Some((name, digest)) = split_last(&rest, BLOBS_SEGMENT) {
        return Some(V2Request::Blob { name, digest });
    }
    None
}

/// Split `/name<segment>reference` at the last occurrence of `segment`
fn split_last(rest: &str, segment: &str) -> Option<(String, String)> {
    let idx = rest.rfind(segment)?;
    let name = rest.get(1..idx).unwrap_or_default();
    let reference = &rest[idx + segment.len()..];
    if name.is_empty() || reference.is_empty() {
        return None;
    }
    Some((name.to_string(), reference.to_string()))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ProxyError::Registry(format!("invalid header value `{}`: {}", value, e)))
}

fn manifest_response(manifest: ProxiedManifest, head: bool) -> Result<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header_value(&manifest.media_type)?);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(manifest.payload.len()));
    headers.insert(DOCKER_CONTENT_DIGEST, header_value(&manifest.digest)?);
    headers.insert(header::ETAG, header_value(&manifest.digest)?);

    let body = if head {
        Body::empty()
    } else {
        Body::from(manifest.payload)
    };
    Ok((StatusCode::OK, headers, body).into_response())
}

fn blob_response(desc: &Descriptor, body: Option<BlobStream>) -> Result<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header_value(&desc.media_type)?);
    if desc.size > 0 {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(desc.size));
    }
    headers.insert(DOCKER_CONTENT_DIGEST, header_value(&desc.digest)?);
    headers.insert(header::ETAG, header_value(&desc.digest)?);

    let body = match body {
        Some(stream) => Body::from_stream(stream),
        None => Body::empty(),
    };
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn serve_manifest(state: &AppState, name: &str, reference: &str, head: bool) -> Result<Response> {
    let art = ArtifactInfo::parse(name, reference)?;
    let project = state.project(&art.project_name).await?;
    let controller = &state.controller;

    let manifest = if controller.use_local_manifest(&project, &art).await {
        let pulled = controller
            .local()
            .pull_manifest(&art.repository, art.reference())
            .await?;
        debug!(
            repository = %art.repository,
            reference = %art.reference(),
            digest = %pulled.digest,
            "Serving manifest from local registry"
        );
        ProxiedManifest {
            media_type: pulled.manifest.media_type().to_string(),
            digest: pulled.digest,
            payload: pulled.manifest.payload().clone(),
        }
    } else if head {
        controller.proxy_manifest_head(&project, &art).await?
    } else {
        controller.proxy_manifest(&project, &art).await?
    };
    manifest_response(manifest, head)
}

async fn serve_blob(state: &AppState, name: &str, digest: &str, head: bool) -> Result<Response> {
    let art = ArtifactInfo::parse(name, digest)?;
    if art.digest.is_empty() {
        return Err(ProxyError::BadRequest(format!("invalid blob digest `{}`", digest)));
    }
    let project = state.project(&art.project_name).await?;
    let controller = &state.controller;

    if controller.use_local_blob(&project, digest).await {
        debug!(repository = %art.repository, digest = %digest, "Serving blob from local registry");
        if head {
            let desc = controller.local().stat_blob(digest).await?;
            return blob_response(&desc, None);
        }
        let (desc, body) = controller.local().pull_blob(&art.repository, digest).await?;
        return blob_response(&desc, Some(body));
    }

    if head {
        let desc = controller.proxy_blob_head(&project, &art, digest).await?;
        return blob_response(&desc, None);
    }
    let blob = controller.proxy_blob(&project, &art, digest).await?;
    blob_response(&blob.descriptor, Some(blob.body))
}

async fn dispatch_v2(state: AppState, uri: Uri, head: bool) -> Response {
    let path = uri.path();
    debug!(path = %path, head = head, "Registry request");
    let result = match parse_v2_path(path) {
        Some(V2Request::Manifest { name, reference }) => {
            serve_manifest(&state, &name, &reference, head).await
        }
        Some(V2Request::Blob { name, digest }) => serve_blob(&state, &name, &digest, head).await,
        None => Err(ProxyError::BadRequest(format!("Invalid v2 path: {}", path))),
    };
    result.into_response()
}

async fn get_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    dispatch_v2(state, uri, false).await
}

async fn head_v2_wrapper(State(state): State<AppState>, uri: Uri) -> Response {
    dispatch_v2(state, uri, true).await
}

async fn api_version() -> impl IntoResponse {
    (StatusCode::OK, "{}")
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version))
        .route("/v2/*path", get(get_v2_wrapper).head(head_v2_wrapper))
        .nest("/api/v2.0", api::routes())
        .route("/health", get(health))
        .with_state(state)
}

async fn connect_store(config: &RedisConfig) -> Result<Option<ConnectionManager>> {
    let Some(url) = config.url.as_deref() else {
        info!("No shared store configured, keeping counters and job state in process");
        return Ok(None);
    };
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client).await?;
    info!(namespace = %config.namespace, "Connected to shared store");
    Ok(Some(conn))
}

/// Everything the server runs on, built from configuration
pub struct Services {
    pub state: AppState,
    pub registries: Arc<ConfiguredRegistries>,
    pub health: HealthChecker,
    pub tasks: BackgroundTasks,
}

pub async fn build_services(storage_dir: PathBuf, config: &Config) -> Result<Services> {
    info!(directory = %storage_dir.display(), "Initializing local registry storage");
    let storage = Arc::new(RegistryStorage::new(storage_dir)?);
    let local = Arc::new(LocalRegistryStore::new(storage));

    let registries = Arc::new(ConfiguredRegistries::new(&config.upstream.registries));
    let adapters = Arc::new(UpstreamAdapterFactory::new(&config.upstream)?);
    let health = HealthChecker::new(
        registries.clone(),
        adapters.client().clone(),
        Duration::from_secs(config.upstream.health_check_interval_secs),
    );

    let (counters, runtime): (Arc<dyn CounterStore>, Arc<dyn WorkRuntime>) =
        match connect_store(&config.redis).await? {
            Some(conn) => (
                Arc::new(RedisCounterStore::new(conn.clone())),
                Arc::new(RedisWorkRuntime::new(conn, config.redis.namespace.clone())),
            ),
            None => (
                Arc::new(MemoryCounterStore::new()),
                Arc::new(MemoryWorkRuntime::new()),
            ),
        };

    let quota = Arc::new(QuotaController::new());
    for project in &config.projects {
        quota.set_limit(project.id, project.storage_limit).await;
    }

    let tasks = BackgroundTasks::new();
    let controller = ProxyController::new(registries.clone(), adapters, local, config.proxy.clone())
        .with_quota(quota)
        .with_limiter(Arc::new(ConnectionLimiter::new(counters)))
        .with_inflight(InflightSet::new())
        .with_tasks(tasks.clone());

    let monitor = MonitorController::new(
        runtime,
        Arc::new(MemoryTaskManager::new()),
        Arc::new(MemoryScheduleManager::new()),
    );

    info!(
        registries = config.upstream.registries.len(),
        projects = config.projects.len(),
        "Proxy services initialized"
    );

    Ok(Services {
        state: AppState {
            controller,
            projects: Arc::new(ConfiguredProjects::new(&config.projects)),
            monitor,
        },
        registries,
        health,
        tasks,
    })
}

/// Serve on an already bound listener until `shutdown` fires, then give background
/// mirroring a grace period to finish
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    tasks: BackgroundTasks,
    shutdown: CancellationToken,
) {
    let app = build_router(state);
    let signal = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
    {
        error!(error = %e, "HTTP server error");
    }
    info!(pending = tasks.len(), "HTTP server stopped, draining background tasks");
    if tasks.shutdown(SHUTDOWN_GRACE).await {
        info!("Background tasks drained");
    }
}

pub async fn start_server(
    storage_dir: PathBuf,
    config: Config,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let services = build_services(storage_dir, &config).await?;

    if config.upstream.health_check_interval_secs > 0 {
        tokio::spawn(services.health.run(shutdown.child_token()));
    }

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::Config(format!("Failed to bind to {}: {}", addr, e)))?;
    info!(address = %addr, "Registry proxy listening");

    Ok(tokio::spawn(serve(
        listener,
        services.state,
        services.tasks,
        shutdown,
    )))
}

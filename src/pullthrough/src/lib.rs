pub mod api;
pub mod background;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod inflight;
pub mod limiter;
pub mod project;
pub mod quota;
pub mod registry;
pub mod server;

pub use background::BackgroundTasks;
pub use cache::RegistryStorage;
pub use config::{Config, ProxyTiming, RegistryType};
pub use controller::{ArtifactInfo, ProxiedBlob, ProxiedManifest, ProxyController};
pub use error::{ProxyError, Result};
pub use inflight::InflightSet;
pub use limiter::{ConnectionLimiter, ConnectionPermit, CounterStore, MemoryCounterStore};
pub use server::{build_router, AppState};

/// Start the registry proxy with the given configuration. The returned task ends
/// once `shutdown` fires and background mirroring has drained.
pub async fn start_server(
    storage_dir: std::path::PathBuf,
    config: Config,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    server::start_server(storage_dir, config, shutdown).await
}

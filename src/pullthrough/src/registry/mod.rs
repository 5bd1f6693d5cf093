pub mod adapter;
pub mod auth;
pub mod local;
pub mod manager;
pub mod manifest;
pub mod upstream;

pub use adapter::{
    AdapterFactory, BlobOracle, BlobStream, LocalRegistry, PulledManifest, RegistryAdapter,
};
pub use local::LocalRegistryStore;
pub use manager::{ConfiguredRegistries, HealthChecker, HealthStatus, Registry, RegistryManager};
pub use manifest::{Descriptor, ImageManifest, Manifest, ManifestIndex};
pub use upstream::{UpstreamAdapter, UpstreamAdapterFactory};

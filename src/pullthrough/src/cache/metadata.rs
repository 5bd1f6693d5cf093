use serde::{Deserialize, Serialize};

/// Stored next to each manifest revision of a repository; the payload itself lives
/// in the blob store under the same digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub digest: String,
    pub media_type: String,
    pub size: u64,
    pub stored_at: u64, // Unix timestamp
}

/// Tag pointer of a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagMapping {
    pub repository: String,
    pub tag: String,
    pub digest: String,
    pub updated_at: u64,
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

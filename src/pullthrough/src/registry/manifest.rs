use crate::error::{ProxyError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_SCHEMA1: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Returns true for both manifest list flavours
pub fn is_index_media_type(media_type: &str) -> bool {
    let base = media_type.split(';').next().unwrap_or(media_type).trim();
    base == MEDIA_TYPE_DOCKER_MANIFEST_LIST || base == MEDIA_TYPE_OCI_INDEX
}

/// `sha256:<hex>` of the given bytes
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// A digest reference is `<algorithm>:<hex>`, anything else is a tag
pub fn is_digest(reference: &str) -> bool {
    match reference.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Content descriptor as produced by a registry adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Value>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            platform: None,
        }
    }
}

/// Single-platform manifest: config plus layers
#[derive(Debug, Clone)]
pub struct ImageManifest {
    pub media_type: String,
    pub config: Option<Descriptor>,
    pub layers: Vec<Descriptor>,
    payload: Bytes,
}

/// Multi-platform manifest list or OCI index
#[derive(Debug, Clone)]
pub struct ManifestIndex {
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    payload: Bytes,
}

/// Manifest shape, decided once when the payload is parsed
#[derive(Debug, Clone)]
pub enum Manifest {
    Image(ImageManifest),
    Index(ManifestIndex),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Option<Vec<Descriptor>>,
    #[serde(default)]
    manifests: Option<Vec<Descriptor>>,
    #[serde(default)]
    fs_layers: Option<Vec<Schema1Layer>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schema1Layer {
    blob_sum: String,
}

impl Manifest {
    /// Parse a manifest payload. `content_type` comes from the registry response and wins
    /// over the embedded `mediaType` field when both are present.
    pub fn parse(content_type: Option<&str>, payload: Bytes) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(&payload)
            .map_err(|e| ProxyError::Manifest(format!("unparseable manifest: {}", e)))?;

        let declared = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
            .filter(|ct| !ct.is_empty() && ct != "application/json" && ct != "text/plain");
        let media_type = declared.or(raw.media_type.clone());

        let index_shaped = raw.manifests.is_some() && raw.layers.is_none();
        let is_index = match media_type.as_deref() {
            Some(mt) => is_index_media_type(mt),
            None => index_shaped,
        };

        if is_index {
            return Ok(Manifest::Index(ManifestIndex {
                media_type: media_type.unwrap_or_else(|| MEDIA_TYPE_OCI_INDEX.to_string()),
                manifests: raw.manifests.unwrap_or_default(),
                payload,
            }));
        }

        if let Some(fs_layers) = raw.fs_layers {
            let layers = fs_layers
                .into_iter()
                .map(|l| Descriptor::new(MEDIA_TYPE_OCTET_STREAM, l.blob_sum, 0))
                .collect();
            return Ok(Manifest::Image(ImageManifest {
                media_type: media_type.unwrap_or_else(|| MEDIA_TYPE_DOCKER_SCHEMA1.to_string()),
                config: None,
                layers,
                payload,
            }));
        }

        if raw.layers.is_none() && raw.config.is_none() {
            return Err(ProxyError::Manifest(
                "manifest has neither layers nor manifests".to_string(),
            ));
        }

        Ok(Manifest::Image(ImageManifest {
            media_type: media_type.unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: raw.config,
            layers: raw.layers.unwrap_or_default(),
            payload,
        }))
    }

    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Image(m) => &m.media_type,
            Manifest::Index(m) => &m.media_type,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Manifest::Image(m) => &m.payload,
            Manifest::Index(m) => &m.payload,
        }
    }

    pub fn digest(&self) -> String {
        digest_of(self.payload())
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Manifest::Index(_))
    }

    /// Everything the manifest points at: child manifests for an index, config and
    /// layers for an image. Schema1 may repeat a layer, duplicates are dropped.
    pub fn references(&self) -> Vec<Descriptor> {
        let mut refs: Vec<Descriptor> = match self {
            Manifest::Index(m) => m.manifests.clone(),
            Manifest::Image(m) => m.config.iter().chain(m.layers.iter()).cloned().collect(),
        };
        let mut seen = std::collections::HashSet::new();
        refs.retain(|d| seen.insert(d.digest.clone()));
        refs
    }
}

impl ManifestIndex {
    /// Keep only the children accepted by `keep`. Returns `None` when nothing is left,
    /// an index without children must never be written.
    pub fn retain<F>(&self, mut keep: F) -> Result<Option<ManifestIndex>>
    where
        F: FnMut(&Descriptor) -> bool,
    {
        let kept: Vec<Descriptor> = self.manifests.iter().filter(|d| keep(d)).cloned().collect();
        if kept.is_empty() {
            return Ok(None);
        }
        if kept.len() == self.manifests.len() {
            return Ok(Some(self.clone()));
        }

        let mut doc: Value = serde_json::from_slice(&self.payload)?;
        let obj = doc.as_object_mut().ok_or_else(|| {
            ProxyError::Manifest("manifest index is not a JSON object".to_string())
        })?;
        obj.insert("manifests".to_string(), serde_json::to_value(&kept)?);
        let payload = Bytes::from(serde_json::to_vec_pretty(&doc)?);

        Ok(Some(ManifestIndex {
            media_type: self.media_type.clone(),
            manifests: kept,
            payload,
        }))
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl ImageManifest {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

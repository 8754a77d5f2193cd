//! Image manifest model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Media type of a Docker image manifest, schema 2.
pub const DISTRIBUTION_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Media type of a Docker image config blob.
pub const IMAGE_CONFIG_V1: &str = "application/vnd.docker.container.image.v1+json";

/// Media type of a gzip-compressed layer.
pub const IMAGE_LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// A content descriptor inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Media type of the referenced blob.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Digest of the referenced blob.
    pub digest: String,
    /// Size of the referenced blob in bytes.
    pub size: u64,
}

/// An image manifest: one config blob and an ordered list of layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Manifest schema version; always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// The image config descriptor.
    pub config: Content,
    /// Layer descriptors, base layer first.
    #[serde(default)]
    pub layers: Vec<Content>,
}

impl Manifest {
    /// Build a schema 2 manifest.
    #[must_use]
    pub fn new(config: Content, layers: Vec<Content>) -> Self {
        Self {
            media_type: DISTRIBUTION_MANIFEST_V2.to_owned(),
            schema_version: 2,
            config,
            layers,
        }
    }
}

/// `sha256:<hex>` digest of `data`.
#[must_use]
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

//! Image manifest and configuration types.
//!
//! Covers the Docker Image Manifest V2 Schema 2 and the OCI Image
//! Specification v1.1.0: <https://github.com/opencontainers/image-spec>
//!
//! Maps are `BTreeMap` so that serialized configs and manifests are byte-stable
//! for identical inputs.

use std::collections::BTreeMap;

use kiln_common::{Digest, KilnError, KilnResult};
use serde::{Deserialize, Serialize};

/// Common media types.
pub mod media_types {
    /// OCI image manifest media type.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index media type.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image config media type.
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// OCI layer media type (tar+gzip).
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

    /// Docker manifest v2 schema 2 media type.
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker manifest list media type.
    pub const DOCKER_INDEX: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    /// Docker image config media type.
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    /// Docker layer media type.
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Every manifest type we can pull, for the `Accept` header.
    pub const ACCEPTED_MANIFESTS: [&str; 4] = [DOCKER_MANIFEST, MANIFEST, DOCKER_INDEX, INDEX];
}

/// Manifest flavour produced by a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Docker V2.2 manifest.
    #[default]
    Docker,
    /// OCI manifest.
    Oci,
}

impl ImageFormat {
    /// Media type of the manifest.
    #[must_use]
    pub const fn manifest_media_type(self) -> &'static str {
        match self {
            Self::Docker => media_types::DOCKER_MANIFEST,
            Self::Oci => media_types::MANIFEST,
        }
    }

    /// Media type of the container configuration blob.
    #[must_use]
    pub const fn config_media_type(self) -> &'static str {
        match self {
            Self::Docker => media_types::DOCKER_CONFIG,
            Self::Oci => media_types::CONFIG,
        }
    }

    /// Media type of a compressed layer.
    #[must_use]
    pub const fn layer_media_type(self) -> &'static str {
        match self {
            Self::Docker => media_types::DOCKER_LAYER,
            Self::Oci => media_types::LAYER_TAR_GZIP,
        }
    }
}

/// Image manifest (Docker V2.2 or OCI; the two share one shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type of the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration descriptor.
    pub config: Descriptor,
    /// Image layers, bottom first.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Assemble a manifest for `format`.
    #[must_use]
    pub fn new(format: ImageFormat, config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(format.manifest_media_type().to_string()),
            config,
            layers,
        }
    }

    /// Serialize to the bytes that get pushed and digested.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> KilnResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Image index / manifest list (multi-architecture manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Manifest list.
    pub manifests: Vec<ManifestDescriptor>,
}

impl ImageIndex {
    /// Find the manifest for `platform`.
    #[must_use]
    pub fn find(&self, platform: &Platform) -> Option<&ManifestDescriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == platform.os && p.architecture == platform.architecture)
        })
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content size in bytes.
    pub size: u64,
    /// Content digest.
    pub digest: Digest,
}

/// Manifest descriptor with platform information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    /// Base descriptor.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Operating system.
    pub os: String,
    /// Architecture.
    pub architecture: String,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform for linux/amd64.
    #[must_use]
    pub fn linux_amd64() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

/// A manifest as served by a registry: either a single image or a list.
#[derive(Debug, Clone)]
pub enum PulledManifest {
    /// Single-platform image manifest.
    Image(ImageManifest),
    /// Multi-platform manifest list.
    Index(ImageIndex),
}

impl PulledManifest {
    /// Interpret manifest bytes.
    ///
    /// # Errors
    ///
    /// Returns an error for schema 1 manifests or unparseable JSON.
    pub fn from_slice(bytes: &[u8]) -> KilnResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;

        if value.get("schemaVersion").and_then(serde_json::Value::as_u64) != Some(2) {
            return Err(KilnError::Serialization(
                "Only schema version 2 manifests are supported".to_string(),
            ));
        }

        let is_index = match value.get("mediaType").and_then(serde_json::Value::as_str) {
            Some(media_types::DOCKER_INDEX | media_types::INDEX) => true,
            Some(_) => false,
            None => value.get("manifests").is_some(),
        };

        if is_index {
            Ok(Self::Index(serde_json::from_value(value)?))
        } else {
            Ok(Self::Image(serde_json::from_value(value)?))
        }
    }
}

/// Empty JSON object, used as the value of port and volume sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Image configuration blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfiguration {
    /// Creation timestamp (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Execution parameters.
    #[serde(default)]
    pub config: ExecutionConfig,
    /// Rootfs information.
    #[serde(default)]
    pub rootfs: RootFs,
    /// History entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl ContainerConfiguration {
    /// Serialize to the bytes that get pushed and digested.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> KilnResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Execution configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionConfig {
    /// User.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Exposed ports (`8080/tcp`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, EmptyObject>>,
    /// Environment variables (`KEY=value`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Entrypoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, EmptyObject>>,
    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Root filesystem information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Type (must be "layers").
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Layer diff IDs (uncompressed digests).
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// History entry for an image layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Command that created this layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Whether this entry has no layer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// One image entry of a `docker load` tarball's `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DockerLoadManifestEntry {
    /// Path of the config file inside the tarball.
    pub config: String,
    /// Tags to apply on load.
    pub repo_tags: Vec<String>,
    /// Paths of the layer blobs inside the tarball, bottom first.
    pub layers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(data: &[u8], media_type: &str) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            size: data.len() as u64,
            digest: Digest::of(data),
        }
    }

    #[test]
    fn manifest_serialization() {
        let manifest = ImageManifest::new(
            ImageFormat::Docker,
            descriptor(b"config", media_types::DOCKER_CONFIG),
            vec![descriptor(b"layer", media_types::DOCKER_LAYER)],
        );

        insta::assert_snapshot!(String::from_utf8(manifest.to_bytes().unwrap()).unwrap());
    }

    #[test]
    fn pulled_manifest_detects_index() {
        let index = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [{
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "size": 7,
                "digest": "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                "platform": {"os": "linux", "architecture": "amd64"}
            }]
        }"#;

        match PulledManifest::from_slice(index).unwrap() {
            PulledManifest::Index(index) => {
                assert!(index.find(&Platform::linux_amd64()).is_some());
            }
            PulledManifest::Image(_) => panic!("expected an index"),
        }
    }

    #[test]
    fn pulled_manifest_rejects_schema_one() {
        let v1 = br#"{"schemaVersion": 1, "fsLayers": []}"#;
        assert!(PulledManifest::from_slice(v1).is_err());
    }

    #[test]
    fn config_serialization_is_stable() {
        let mut config = ContainerConfiguration {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            ..Default::default()
        };
        config.config.labels = Some(
            [("b", "2"), ("a", "1")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );

        let first = config.to_bytes().unwrap();
        let second = config.clone().to_bytes().unwrap();
        assert_eq!(first, second);
        assert!(String::from_utf8(first).unwrap().contains(r#""Labels":{"a":"1","b":"2"}"#));
    }
}

//! In-memory model of the image being built.

use kiln_common::{BlobDescriptor, KilnResult};
use kiln_oci::{ContainerConfiguration, Descriptor, ImageFormat, ImageManifest};
use kiln_oci::image::{ExecutionConfig, HistoryEntry, RootFs};

use crate::cache::CachedLayer;

/// An image assembled from cached layers and execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Manifest flavor to produce.
    pub format: ImageFormat,
    /// Layers, bottom first.
    pub layers: Vec<CachedLayer>,
    /// History entries, bottom first.
    pub history: Vec<HistoryEntry>,
    /// Creation timestamp (RFC 3339).
    pub created: Option<String>,
    /// Architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Execution parameters.
    pub execution: ExecutionConfig,
}

impl Image {
    /// An empty linux/amd64 image.
    #[must_use]
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            layers: Vec::new(),
            history: Vec::new(),
            created: None,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            execution: ExecutionConfig::default(),
        }
    }

    /// Start from a base image's configuration, inheriting its execution
    /// parameters, platform and history. Layers are added separately.
    #[must_use]
    pub fn from_base(format: ImageFormat, base: &ContainerConfiguration) -> Self {
        Self {
            history: base.history.clone(),
            architecture: base.architecture.clone(),
            os: base.os.clone(),
            execution: base.config.clone(),
            ..Self::new(format)
        }
    }

    /// Container configuration describing this image.
    #[must_use]
    pub fn configuration(&self) -> ContainerConfiguration {
        ContainerConfiguration {
            created: self.created.clone(),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config: self.execution.clone(),
            rootfs: RootFs {
                diff_ids: self.layers.iter().map(|l| l.diff_id.clone()).collect(),
                ..RootFs::default()
            },
            history: self.history.clone(),
        }
    }

    /// Serialized configuration and its descriptor. The digest is the image id.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn config_blob(&self) -> KilnResult<(Vec<u8>, BlobDescriptor)> {
        let bytes = self.configuration().to_bytes()?;
        let descriptor = BlobDescriptor::of(&bytes);
        Ok((bytes, descriptor))
    }

    /// Manifest referencing `config` and every layer in order.
    #[must_use]
    pub fn manifest(&self, config: &BlobDescriptor) -> ImageManifest {
        let layers = self
            .layers
            .iter()
            .map(|layer| Descriptor {
                media_type: self.format.layer_media_type().to_string(),
                size: layer.size,
                digest: layer.digest.clone(),
            })
            .collect();
        ImageManifest::new(
            self.format,
            Descriptor {
                media_type: self.format.config_media_type().to_string(),
                size: config.size,
                digest: config.digest.clone(),
            },
            layers,
        )
    }
}

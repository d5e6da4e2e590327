//! Resolve the base image: manifest, configuration and layer list.

use std::sync::Arc;

use kiln_common::{BlobDescriptor, Digest, KilnError, KilnResult};
use kiln_image::{AuthScope, ImageMetadata, ImageReference, Layer, blob};
use kiln_oci::image::Platform;
use kiln_oci::{ContainerConfiguration, ImageManifest, PulledManifest};

use super::{blocking, retrieve_registry_credentials};
use crate::context::BuildContext;
use crate::events::{EventHandlers, StepTimer};
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "pull base image";

/// A resolved base image.
#[derive(Debug, Clone)]
pub struct BaseImage {
    /// Reference the image was resolved from.
    pub reference: ImageReference,
    /// Container configuration; `None` for `scratch`.
    pub config: Option<ContainerConfiguration>,
    /// Layers in manifest order, not yet pulled.
    pub layers: Vec<Layer>,
    /// Digest of the single-platform manifest; `None` for `scratch`.
    pub manifest_digest: Option<Digest>,
}

impl BaseImage {
    fn scratch(reference: ImageReference) -> Self {
        Self {
            reference,
            config: None,
            layers: Vec::new(),
            manifest_digest: None,
        }
    }
}

/// Resolve the configured base image.
pub fn start(ctx: &BuildContext, progress: ProgressAllocation, index: usize) -> StepHandle<BaseImage> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let _timer = StepTimer::start(ctx.events(), NAME);
        let base = resolve(&ctx).await?;
        progress.close();
        Ok(base)
    })
}

async fn resolve(ctx: &BuildContext) -> KilnResult<BaseImage> {
    let reference = ctx.config.base_image.clone();
    if reference.is_scratch() {
        ctx.events().lifecycle("Building on scratch");
        return Ok(BaseImage::scratch(reference));
    }

    let metadata = if ctx.config.offline {
        let cache = ctx.base_cache.clone();
        let key = reference.clone();
        blocking("base image metadata lookup", move || cache.load_image_metadata(&key))
            .await?
            .ok_or_else(|| {
                KilnError::config(format!(
                    "Base image {reference} is not cached; build once without offline mode"
                ))
            })?
    } else {
        ctx.events().lifecycle(format!("Getting base image {reference}..."));
        let metadata = pull(ctx, &reference).await?;
        let cache = ctx.base_cache.clone();
        let key = reference.clone();
        let saved = metadata.clone();
        blocking("base image metadata save", move || cache.save_image_metadata(&key, &saved)).await?;
        metadata
    };

    let manifest = match PulledManifest::from_slice(&metadata.manifest)? {
        PulledManifest::Image(manifest) => manifest,
        PulledManifest::Index(_) => {
            return Err(KilnError::CacheCorrupted {
                message: format!("Cached manifest of {reference} is a manifest list"),
            });
        }
    };
    let config: ContainerConfiguration = serde_json::from_slice(&metadata.config)?;
    let layers = layers(&manifest, &config, ctx.events());
    tracing::info!(image = %reference, layers = layers.len(), "Resolved base image");

    Ok(BaseImage {
        manifest_digest: Some(Digest::of(&metadata.manifest)),
        reference,
        config: Some(config),
        layers,
    })
}

/// Pull the single-platform manifest and configuration of `reference`.
async fn pull(ctx: &BuildContext, reference: &ImageReference) -> KilnResult<ImageMetadata> {
    let registry = Arc::clone(&ctx.base_registry);
    let credential = retrieve_registry_credentials::retrieve(
        ctx,
        &reference.registry,
        ctx.config.base_credential.clone(),
    )
    .await?;
    registry.authenticate(credential.as_ref(), AuthScope::Pull).await?;

    let mut manifest_bytes = registry.pull_manifest(reference.tag_or_digest()).await?;
    let manifest = match PulledManifest::from_slice(&manifest_bytes)? {
        PulledManifest::Image(manifest) => manifest,
        PulledManifest::Index(index) => {
            let platform = Platform::linux_amd64();
            let entry = index.find(&platform).ok_or_else(|| KilnError::ImageNotFound {
                reference: format!("{reference} for {}/{}", platform.os, platform.architecture),
            })?;
            let expected = entry.descriptor.digest.clone();
            tracing::debug!(digest = %expected, "Resolved manifest list entry");
            manifest_bytes = registry.pull_manifest(expected.as_str()).await?;
            verify(&expected, &manifest_bytes)?;
            match PulledManifest::from_slice(&manifest_bytes)? {
                PulledManifest::Image(manifest) => manifest,
                PulledManifest::Index(_) => {
                    return Err(KilnError::Registry {
                        status: 200,
                        message: format!("Manifest list of {reference} points at another list"),
                    });
                }
            }
        }
    };

    let config = blob::collect(registry.pull_blob(&manifest.config.digest).await?).await?;
    verify(&manifest.config.digest, &config)?;

    Ok(ImageMetadata {
        manifest: manifest_bytes,
        config,
    })
}

fn verify(expected: &Digest, bytes: &[u8]) -> KilnResult<()> {
    let actual = Digest::of(bytes);
    if &actual == expected {
        Ok(())
    } else {
        Err(KilnError::Integrity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn layers(manifest: &ImageManifest, config: &ContainerConfiguration, events: &EventHandlers) -> Vec<Layer> {
    if manifest.layers.len() != config.rootfs.diff_ids.len() {
        events.warn(format!(
            "Base image has {} layers but {} diff ids",
            manifest.layers.len(),
            config.rootfs.diff_ids.len()
        ));
    }
    manifest
        .layers
        .iter()
        .enumerate()
        .map(|(i, descriptor)| Layer::Reference {
            descriptor: BlobDescriptor {
                digest: descriptor.digest.clone(),
                size: descriptor.size,
            },
            diff_id: config.rootfs.diff_ids.get(i).cloned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use kiln_oci::image::{Descriptor, RootFs, media_types};

    use super::*;
    use crate::events::{BuildEvent, EventBus, LogLevel};

    fn manifest_with(layers: usize) -> ImageManifest {
        let descriptor = |i: usize| Descriptor {
            media_type: media_types::DOCKER_LAYER.to_string(),
            size: 10,
            digest: Digest::of(format!("layer {i}").as_bytes()),
        };
        ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::DOCKER_MANIFEST.to_string()),
            config: Descriptor {
                media_type: media_types::DOCKER_CONFIG.to_string(),
                size: 2,
                digest: Digest::of(b"{}"),
            },
            layers: (0..layers).map(descriptor).collect(),
        }
    }

    #[test]
    fn missing_diff_ids_are_tolerated_with_a_warning() {
        let bus = EventBus::new();
        let mut received = bus.subscribe();
        let events = EventHandlers::none().with(bus);
        let config = ContainerConfiguration {
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![Digest::of(b"diff 0")],
            },
            ..ContainerConfiguration::default()
        };

        let layers = layers(&manifest_with(2), &config, &events);

        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].diff_id(), Some(&Digest::of(b"diff 0")));
        assert_eq!(layers[1].diff_id(), None);
        assert!(matches!(
            received.try_recv().unwrap(),
            BuildEvent::Log { level: LogLevel::Warn, message } if message.contains("2 layers but 1 diff ids")
        ));
    }

    #[test]
    fn matching_counts_stay_quiet() {
        let bus = EventBus::new();
        let mut received = bus.subscribe();
        let events = EventHandlers::none().with(bus);
        let config = ContainerConfiguration {
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![Digest::of(b"diff 0")],
            },
            ..ContainerConfiguration::default()
        };

        assert_eq!(layers(&manifest_with(1), &config, &events).len(), 1);
        assert!(received.try_recv().is_err());
    }
}

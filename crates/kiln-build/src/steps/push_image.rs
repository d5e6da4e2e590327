//! Push the image manifest under every tag.

use kiln_common::{BlobDescriptor, KilnError};
use kiln_image::Image;

use super::PushSteps;
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::result::BuildResult;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "push image";

/// Blobs the manifest refers to, which must be in the registry first.
#[derive(Debug, Clone)]
pub struct PushedBlobs {
    /// Base layer pushes.
    pub base_layers: StepHandle<PushSteps>,
    /// Application layer pushes.
    pub application_layers: StepHandle<PushSteps>,
    /// Configuration push.
    pub container_configuration: StepHandle<BlobDescriptor>,
}

/// Push the manifest once every blob it references has been pushed.
pub fn start(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    authenticate: StepHandle<()>,
    blobs: PushedBlobs,
    image: StepHandle<Image>,
) -> StepHandle<BuildResult> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        authenticate.wait_for(NAME).await?;
        blobs.base_layers.wait_for(NAME).await?.pushed(NAME).await?;
        blobs.application_layers.wait_for(NAME).await?.pushed(NAME).await?;
        blobs.container_configuration.wait_for(NAME).await?;
        let image = image.wait_for(NAME).await?;
        let _timer = StepTimer::start(ctx.events(), NAME);

        let (_, config) = image.config_blob()?;
        let manifest = image.manifest(&config).to_bytes()?;
        let media_type = image.format.manifest_media_type();
        let target = &ctx.config.target_image;

        let mut manifest_digest = None;
        let mut tags = Vec::new();
        for tag in ctx.config.all_tags() {
            let digest = ctx
                .target_registry
                .push_manifest(&manifest, media_type, &tag)
                .await?;
            if manifest_digest.as_ref().is_some_and(|d| d != &digest) {
                return Err(KilnError::Registry {
                    status: 201,
                    message: format!("Registry reported a different manifest digest for tag {tag}"),
                });
            }
            let reference = target.with_tag(&tag).full_reference();
            ctx.events().lifecycle(format!("Pushed {reference}"));
            tags.push(reference);
            manifest_digest = Some(digest);
        }
        let manifest_digest = manifest_digest
            .ok_or_else(|| KilnError::internal("target image has no tags to push"))?;

        progress.close();
        Ok(BuildResult::new(config.digest, manifest_digest, tags))
    })
}

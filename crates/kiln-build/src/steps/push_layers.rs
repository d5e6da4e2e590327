//! Push layers to the target registry.
//!
//! Each layer is pushed by its own step as soon as both authentication and
//! that particular layer are done, so pushing overlaps with pulling and
//! building the remaining layers.

use std::future::Future;

use kiln_common::{BlobDescriptor, KilnResult};
use kiln_image::CachedLayer;
use kiln_image::blob::file_stream;
use kiln_image::registry::BlobStream;

use super::{LayerSteps, PushSteps};
use crate::context::BuildContext;
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Name of the base layer push step.
pub const BASE_NAME: &str = "push base image layers";

/// Name of the application layer push step.
pub const APPLICATION_NAME: &str = "push application layers";

/// Name of each per-layer push step.
pub const LAYER_NAME: &str = "push layer";

/// Push every base image layer.
pub fn start_base(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    authenticate: StepHandle<()>,
    layers: StepHandle<LayerSteps>,
) -> StepHandle<PushSteps> {
    start(BASE_NAME, ctx, progress, index, authenticate, layers)
}

/// Push every application layer.
pub fn start_application(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    authenticate: StepHandle<()>,
    layers: StepHandle<LayerSteps>,
) -> StepHandle<PushSteps> {
    start(APPLICATION_NAME, ctx, progress, index, authenticate, layers)
}

fn start(
    name: &'static str,
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    authenticate: StepHandle<()>,
    layers: StepHandle<LayerSteps>,
) -> StepHandle<PushSteps> {
    let ctx = ctx.clone();
    StepHandle::spawn(name, index, async move {
        let layers = layers.wait_for(name).await?;
        let push_progress =
            progress.allocate(format!("{} layers", layers.len()), 1, layers.len() as u64)?;

        let handles = layers
            .handles()
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                let layer_progress = push_progress.allocate(format!("layer {i}"), 1, 1)?;
                Ok(start_layer(
                    &ctx,
                    layer_progress,
                    i,
                    authenticate.clone(),
                    layer.clone(),
                ))
            })
            .collect::<KilnResult<Vec<_>>>()?;

        Ok(PushSteps::new(handles))
    })
}

fn start_layer(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    authenticate: StepHandle<()>,
    layer: StepHandle<CachedLayer>,
) -> StepHandle<BlobDescriptor> {
    let ctx = ctx.clone();
    StepHandle::spawn(LAYER_NAME, index, async move {
        authenticate.wait_for(LAYER_NAME).await?;
        let layer = layer.wait_for(LAYER_NAME).await?;

        let descriptor = BlobDescriptor {
            digest: layer.digest.clone(),
            size: layer.size,
        };
        let path = layer.blob_path.clone();
        let pushed = push_blob(&ctx, &descriptor, || file_stream(path.clone())).await?;
        progress.close();
        Ok(pushed)
    })
}

/// Push a blob unless the registry already has it.
///
/// `open` is only called when the blob actually has to be sent, once per
/// upload attempt.
///
/// # Errors
///
/// Returns transport errors and errors from `open`.
pub(crate) async fn push_blob<F, Fut>(
    ctx: &BuildContext,
    descriptor: &BlobDescriptor,
    open: F,
) -> KilnResult<BlobDescriptor>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = KilnResult<BlobStream>> + Send,
{
    let _permit = ctx.transfer_permit().await?;
    let digest = &descriptor.digest;

    if let Some(size) = ctx.target_registry.check_blob(digest).await? {
        tracing::debug!(digest = %digest, "Blob already exists in target registry");
        return Ok(BlobDescriptor {
            digest: digest.clone(),
            size,
        });
    }

    tracing::debug!(digest = %digest, size = descriptor.size, "Pushing blob");
    let open = &open;
    ctx.config
        .transport
        .retry
        .run(|| async move {
            let data = open().await?;
            ctx.target_registry
                .push_blob(digest, descriptor.size, data)
                .await
        })
        .await?;
    Ok(descriptor.clone())
}

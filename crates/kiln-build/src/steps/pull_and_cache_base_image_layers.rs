//! Pull base image layers into the base layer cache.
//!
//! Every layer gets its own step, all launched together. A layer already in
//! the cache is returned without touching the registry; otherwise its blob is
//! streamed from the registry through a bounded channel into a verified cache
//! write on the blocking pool. A download that breaks off midway is redone
//! from the start under the transport's retry policy.

use std::sync::atomic::{AtomicU64, Ordering};

use kiln_common::{Digest, KilnError, KilnResult};
use kiln_image::blob::{self, ChannelReader};
use kiln_image::{CachedLayer, Layer};

use super::{BaseImage, LayerSteps, blocking};
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "pull and cache base image layers";

/// Name of each per-layer step.
pub const LAYER_NAME: &str = "pull and cache base image layer";

/// Launch one pull step per base layer once the base image is resolved.
pub fn start(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    base_image: StepHandle<BaseImage>,
) -> StepHandle<LayerSteps> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let base = base_image.wait_for(NAME).await?;
        let layers_progress =
            progress.allocate(format!("{} layers", base.layers.len()), 1, base.layers.len() as u64)?;

        let handles = base
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| {
                let layer_progress =
                    layers_progress.allocate(format!("layer {}", layer.digest().short()), 1, layer.size())?;
                Ok(start_layer(&ctx, layer_progress, i, layer))
            })
            .collect::<KilnResult<Vec<_>>>()?;

        Ok(LayerSteps::new(handles))
    })
}

/// Pull and cache a single layer.
pub fn start_layer(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    layer: Layer,
) -> StepHandle<CachedLayer> {
    let ctx = ctx.clone();
    StepHandle::spawn(LAYER_NAME, index, async move {
        let _timer = StepTimer::start(
            ctx.events(),
            format!("Pulling base image layer {}", layer.digest().short()),
        );
        let cached = pull_and_cache(&ctx, &progress, index, &layer).await?;
        progress.close();
        Ok(cached)
    })
}

async fn pull_and_cache(
    ctx: &BuildContext,
    progress: &ProgressAllocation,
    index: usize,
    layer: &Layer,
) -> KilnResult<CachedLayer> {
    if let Some(cached) = layer.as_cached() {
        return Ok(cached.clone());
    }
    let digest = layer.digest().clone();

    let cache = ctx.base_cache.clone();
    let lookup = digest.clone();
    if let Some(cached) = blocking("layer cache lookup", move || cache.retrieve(&lookup)).await? {
        tracing::debug!(digest = %digest, layer = index, "Base image layer already cached");
        return Ok(cached);
    }

    if ctx.config.offline {
        return Err(KilnError::config(format!(
            "Base image layer {digest} is not cached and offline mode is on"
        )));
    }

    let _permit = ctx.transfer_permit().await?;
    tracing::debug!(digest = %digest, layer = index, size = layer.size(), "Pulling base image layer");
    let reported = AtomicU64::new(0);
    let cached = ctx
        .config
        .transport
        .retry
        .run(|| download(ctx, progress, &digest, &reported))
        .await?;
    tracing::info!(digest = %cached.digest, layer = index, size = cached.size, "Cached base image layer");
    Ok(cached)
}

/// One attempt at streaming `digest` into the base cache.
///
/// Bytes already reported by an earlier attempt are not reported again.
async fn download(
    ctx: &BuildContext,
    progress: &ProgressAllocation,
    digest: &Digest,
    reported: &AtomicU64,
) -> KilnResult<CachedLayer> {
    let stream = ctx.base_registry.pull_blob(digest).await?;

    let (tx, reader) = ChannelReader::channel();
    let cache = ctx.base_cache.clone();
    let expected = digest.clone();
    let writer =
        tokio::task::spawn_blocking(move || cache.write_compressed_verified(&expected, reader));

    let mut received = 0;
    blob::forward(stream, tx, |n| {
        received += n;
        let before = reported.fetch_max(received, Ordering::Relaxed);
        if received > before {
            progress.complete(received - before);
        }
    })
    .await;

    writer
        .await
        .map_err(|e| KilnError::internal(format!("layer cache write did not finish: {e}")))?
}

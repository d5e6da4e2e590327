//! Build application layers, reusing cached builds of unchanged inputs.

use std::io::{BufReader, Seek};

use kiln_common::KilnResult;
use kiln_image::{CachedLayer, LayerCache, LayerConfiguration};

use super::{LayerSteps, blocking};
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "build and cache application layers";

/// Name of each per-layer step.
pub const LAYER_NAME: &str = "build and cache application layer";

/// Launch one build step per configured application layer.
pub fn start(ctx: &BuildContext, progress: ProgressAllocation, index: usize) -> StepHandle<LayerSteps> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let layers = ctx.config.layers.clone();
        let layers_progress =
            progress.allocate(format!("{} layers", layers.len()), 1, layers.len() as u64)?;

        let handles = layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| {
                let layer_progress = layers_progress.allocate(layer.name.clone(), 1, 1)?;
                Ok(start_layer(&ctx, layer_progress, i, layer))
            })
            .collect::<KilnResult<Vec<_>>>()?;

        Ok(LayerSteps::new(handles))
    })
}

/// Build and cache a single application layer.
pub fn start_layer(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    layer: LayerConfiguration,
) -> StepHandle<CachedLayer> {
    let ctx = ctx.clone();
    StepHandle::spawn(LAYER_NAME, index, async move {
        let _timer = StepTimer::start(ctx.events(), format!("Building {} layer", layer.name));
        let cache = ctx.application_cache.clone();
        let name = layer.name.clone();
        let cached = blocking("application layer build", move || build_and_cache(&cache, &layer)).await?;
        tracing::info!(layer = %name, digest = %cached.digest, "Application layer ready");
        progress.close();
        Ok(cached)
    })
}

fn build_and_cache(cache: &LayerCache, layer: &LayerConfiguration) -> KilnResult<CachedLayer> {
    let selector = layer.selector()?;
    if let Some(cached) = cache.retrieve_by_selector(&selector)? {
        tracing::debug!(layer = %layer.name, selector = %selector, "Reusing cached application layer");
        return Ok(cached);
    }

    let mut spool = layer.write_tar(tempfile::tempfile()?)?;
    spool.rewind()?;
    cache.write_uncompressed(BufReader::new(spool), &selector)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kiln_image::LayerEntry;

    use super::*;

    #[test]
    fn unchanged_inputs_reuse_the_cached_layer() {
        let sources = tempfile::tempdir().unwrap();
        let file = sources.path().join("server");
        fs::write(&file, b"#!/bin/sh\necho hi\n").unwrap();
        let layer = LayerConfiguration::new(
            "app",
            vec![LayerEntry::new(&file, "/app/server").unwrap()],
        );

        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();
        let first = build_and_cache(&cache, &layer).unwrap();
        let second = build_and_cache(&cache, &layer).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.list_entries().unwrap().len(), 1);

        fs::write(&file, b"#!/bin/sh\necho changed, and longer\n").unwrap();
        let rebuilt = build_and_cache(&cache, &layer).unwrap();
        assert_ne!(rebuilt.digest, first.digest);
    }
}

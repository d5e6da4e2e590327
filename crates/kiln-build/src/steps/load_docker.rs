//! Load the built image into the local docker daemon.

use std::io::BufWriter;

use kiln_common::KilnError;
use kiln_image::{Image, ImageTarball};

use super::blocking;
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::result::BuildResult;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "load docker";

/// Write the image as a tarball, `docker load` it and apply the extra tags.
pub fn start(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    image: StepHandle<Image>,
) -> StepHandle<BuildResult> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let image = image.wait_for(NAME).await?;
        let _timer = StepTimer::start(ctx.events(), NAME);

        let target = &ctx.config.target_image;
        let primary = target.full_reference();
        let tarball = {
            let image = image.clone();
            let tag = primary.clone();
            blocking("image tarball write", move || {
                let file = tempfile::Builder::new()
                    .prefix("kiln-")
                    .suffix(".tar")
                    .tempfile()?;
                let (writer, path) = file.into_parts();
                ImageTarball::new(&image, vec![tag])
                    .write(BufWriter::new(writer))?
                    .into_inner()
                    .map_err(|e| KilnError::Io(e.into_error()))?;
                Ok(path)
            })
            .await?
        };

        ctx.events().lifecycle(format!("Loading {primary} into docker"));
        let output = ctx.docker.load(&tarball).await?;
        tracing::debug!(output = %output.trim(), "docker load finished");

        let mut tags = vec![primary.clone()];
        for tag in ctx.config.all_tags().into_iter().skip(1) {
            let reference = target.with_tag(tag).full_reference();
            ctx.docker.tag(&primary, &reference).await?;
            tags.push(reference);
        }
        drop(tarball);

        progress.close();
        BuildResult::for_image(&image, tags)
    })
}

//! Write the built image as a `docker load` compatible archive.

use std::io::BufWriter;
use std::path::PathBuf;

use kiln_common::KilnError;
use kiln_image::{Image, ImageTarball};

use super::blocking;
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::result::BuildResult;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "write tar file";

/// Write the image to `output`, tagged with every configured tag.
pub fn start(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    image: StepHandle<Image>,
    output: PathBuf,
) -> StepHandle<BuildResult> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let image = image.wait_for(NAME).await?;
        let _timer = StepTimer::start(ctx.events(), NAME);

        let target = &ctx.config.target_image;
        let tags: Vec<String> = ctx
            .config
            .all_tags()
            .into_iter()
            .map(|tag| target.with_tag(tag).full_reference())
            .collect();

        {
            let image = image.clone();
            let tags = tags.clone();
            let output = output.clone();
            blocking("image tarball write", move || {
                let dir = output
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map_or_else(|| PathBuf::from("."), PathBuf::from);
                std::fs::create_dir_all(&dir)?;
                // Staged beside the destination, then renamed into place.
                let staging = tempfile::NamedTempFile::new_in(&dir)?;
                let writer = ImageTarball::new(&image, tags).write(BufWriter::new(staging))?;
                let staging = writer
                    .into_inner()
                    .map_err(|e| KilnError::Io(e.into_error()))?;
                staging
                    .persist(&output)
                    .map_err(|e| KilnError::Io(e.error))?;
                Ok(())
            })
            .await?;
        }

        ctx.events()
            .lifecycle(format!("Wrote image tarball to {}", output.display()));
        progress.close();
        BuildResult::for_image(&image, tags)
    })
}

//! Push the container configuration blob.

use bytes::Bytes;
use futures::StreamExt;
use kiln_common::{BlobDescriptor, KilnError};
use kiln_image::Image;

use super::push_layers::push_blob;
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "push container configuration";

/// Push the configuration of the built image.
pub fn start(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    authenticate: StepHandle<()>,
    image: StepHandle<Image>,
) -> StepHandle<BlobDescriptor> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        authenticate.wait_for(NAME).await?;
        let image = image.wait_for(NAME).await?;
        let _timer = StepTimer::start(ctx.events(), NAME);

        let (config, descriptor) = image.config_blob()?;
        let config = Bytes::from(config);
        let pushed = push_blob(&ctx, &descriptor, || {
            let chunk = config.clone();
            futures::future::ok::<_, KilnError>(futures::stream::once(async move { Ok::<_, KilnError>(chunk) }).boxed())
        })
        .await?;
        tracing::debug!(digest = %pushed.digest, "Pushed container configuration");
        progress.close();
        Ok(pushed)
    })
}

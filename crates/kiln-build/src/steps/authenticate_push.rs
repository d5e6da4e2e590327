//! Authenticate against the target registry with push access.

use kiln_image::{AuthScope, Credential};

use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "authenticate push";

/// Authenticate with the credential produced by `credentials`.
pub fn start(
    ctx: &BuildContext,
    progress: ProgressAllocation,
    index: usize,
    credentials: StepHandle<Option<Credential>>,
) -> StepHandle<()> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let credential = credentials.wait_for(NAME).await?;
        let _timer = StepTimer::start(ctx.events(), NAME);
        ctx.target_registry
            .authenticate(credential.as_ref(), AuthScope::Push)
            .await?;
        tracing::debug!(registry = %ctx.config.target_image.registry, "Authenticated for push");
        progress.close();
        Ok(())
    })
}

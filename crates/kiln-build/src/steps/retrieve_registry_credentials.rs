//! Look up the credential for a registry.

use kiln_common::KilnResult;
use kiln_image::Credential;

use super::blocking;
use crate::context::BuildContext;
use crate::events::StepTimer;
use crate::progress::ProgressAllocation;
use crate::step::StepHandle;

/// Step name.
pub const NAME: &str = "retrieve target registry credentials";

/// Retrieve the credential for the target registry.
pub fn start(ctx: &BuildContext, progress: ProgressAllocation, index: usize) -> StepHandle<Option<Credential>> {
    let ctx = ctx.clone();
    StepHandle::spawn(NAME, index, async move {
        let _timer = StepTimer::start(ctx.events(), NAME);
        let registry = ctx.config.target_image.registry.clone();
        let credential = retrieve(&ctx, &registry, ctx.config.target_credential.clone()).await?;
        progress.close();
        Ok(credential)
    })
}

/// The configured credential if there is one, otherwise whatever the
/// credential retriever finds for `registry`.
///
/// # Errors
///
/// Returns an error if a credential source exists but cannot be read.
pub async fn retrieve(
    ctx: &BuildContext,
    registry: &str,
    configured: Option<Credential>,
) -> KilnResult<Option<Credential>> {
    if let Some(credential) = configured {
        tracing::debug!(registry, "Using configured credential");
        return Ok(Some(credential));
    }

    let retriever = std::sync::Arc::clone(&ctx.credentials);
    let source = retriever.name();
    let host = registry.to_string();
    let found = blocking("credential lookup", move || retriever.retrieve(&host)).await?;

    if found.is_some() {
        tracing::debug!(registry, source, "Retrieved credential");
    } else {
        ctx.events()
            .lifecycle(format!("No credentials found for {registry}, using anonymous access"));
    }
    Ok(found)
}

//! Build steps.
//!
//! Each module exposes a `start` function that launches the step and returns
//! its [`StepHandle`]. Steps receive the handles they depend on and await
//! them inside their own task, so independent branches of the pipeline run
//! concurrently.

pub mod authenticate_push;
pub mod build_and_cache_application_layers;
pub mod build_image;
pub mod load_docker;
pub mod pull_and_cache_base_image_layers;
pub mod pull_base_image;
pub mod push_container_configuration;
pub mod push_image;
pub mod push_layers;
pub mod retrieve_registry_credentials;
pub mod write_tar_file;

use futures::future::try_join_all;
use kiln_common::{BlobDescriptor, KilnError, KilnResult};
use kiln_image::CachedLayer;

use crate::step::StepHandle;

pub use pull_base_image::BaseImage;

/// Per-layer steps, in manifest or declaration order.
#[derive(Debug, Clone, Default)]
pub struct LayerSteps {
    handles: Vec<StepHandle<CachedLayer>>,
}

impl LayerSteps {
    pub(crate) const fn new(handles: Vec<StepHandle<CachedLayer>>) -> Self {
        Self { handles }
    }

    /// The per-layer handles.
    #[must_use]
    pub fn handles(&self) -> &[StepHandle<CachedLayer>] {
        &self.handles
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether there are no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every layer. The result follows layer order regardless of
    /// which layer finished first.
    ///
    /// # Errors
    ///
    /// Returns the first layer failure, wrapped for `dependent`.
    pub async fn cached_layers(&self, dependent: &'static str) -> KilnResult<Vec<CachedLayer>> {
        try_join_all(self.handles.iter().map(|handle| handle.wait_for(dependent))).await
    }
}

/// Per-blob push steps.
#[derive(Debug, Clone, Default)]
pub struct PushSteps {
    handles: Vec<StepHandle<BlobDescriptor>>,
}

impl PushSteps {
    pub(crate) const fn new(handles: Vec<StepHandle<BlobDescriptor>>) -> Self {
        Self { handles }
    }

    /// Wait for every push.
    ///
    /// # Errors
    ///
    /// Returns the first push failure, wrapped for `dependent`.
    pub async fn pushed(&self, dependent: &'static str) -> KilnResult<Vec<BlobDescriptor>> {
        try_join_all(self.handles.iter().map(|handle| handle.wait_for(dependent))).await
    }
}

/// Await a blocking task, turning a panic into an internal error.
pub(crate) async fn blocking<T, F>(what: &str, f: F) -> KilnResult<T>
where
    F: FnOnce() -> KilnResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::internal(format!("{what} did not finish: {e}")))?
}

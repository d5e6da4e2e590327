//! Composes build steps into a pipeline and runs it.
//!
//! Stages are registered in order, each with a display index. [`StepsRunner::run`]
//! checks that every stage's prerequisites were registered before it and that
//! exactly one stage produces the [`BuildResult`], then starts every stage in
//! registration order and waits for that terminal stage.

use std::fmt;
use std::path::PathBuf;

use kiln_common::{BlobDescriptor, KilnError, KilnResult};
use kiln_image::{Credential, Image};

use crate::context::BuildContext;
use crate::progress::ProgressAllocation;
use crate::result::BuildResult;
use crate::step::StepHandle;
use crate::steps::push_image::PushedBlobs;
use crate::steps::{
    BaseImage, LayerSteps, PushSteps, authenticate_push, build_and_cache_application_layers,
    build_image, load_docker, pull_and_cache_base_image_layers, pull_base_image,
    push_container_configuration, push_image, push_layers, retrieve_registry_credentials,
    write_tar_file,
};

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Resolve the base image.
    PullBaseImage,
    /// Pull and cache every base layer.
    PullAndCacheBaseImageLayers,
    /// Build and cache every application layer.
    BuildAndCacheApplicationLayers,
    /// Assemble the image.
    BuildImage,
    /// Find the target registry credential.
    RetrieveTargetRegistryCredentials,
    /// Authenticate for push.
    AuthenticatePush,
    /// Push base layers.
    PushBaseImageLayers,
    /// Push application layers.
    PushApplicationLayers,
    /// Push the configuration blob.
    PushContainerConfiguration,
    /// Push the manifest.
    PushImage,
    /// Load into the docker daemon.
    LoadDocker,
    /// Write a tarball.
    WriteTarFile,
}

impl StepKind {
    /// Stages that must be registered before this one.
    #[must_use]
    pub const fn prerequisites(self) -> &'static [Self] {
        match self {
            Self::PullBaseImage
            | Self::BuildAndCacheApplicationLayers
            | Self::RetrieveTargetRegistryCredentials => &[],
            Self::PullAndCacheBaseImageLayers => &[Self::PullBaseImage],
            Self::BuildImage => &[
                Self::PullBaseImage,
                Self::PullAndCacheBaseImageLayers,
                Self::BuildAndCacheApplicationLayers,
            ],
            Self::AuthenticatePush => &[Self::RetrieveTargetRegistryCredentials],
            Self::PushBaseImageLayers => &[Self::AuthenticatePush, Self::PullAndCacheBaseImageLayers],
            Self::PushApplicationLayers => {
                &[Self::AuthenticatePush, Self::BuildAndCacheApplicationLayers]
            }
            Self::PushContainerConfiguration => &[Self::AuthenticatePush, Self::BuildImage],
            Self::PushImage => &[
                Self::AuthenticatePush,
                Self::PushBaseImageLayers,
                Self::PushApplicationLayers,
                Self::PushContainerConfiguration,
                Self::BuildImage,
            ],
            Self::LoadDocker | Self::WriteTarFile => &[Self::BuildImage],
        }
    }

    /// Whether this stage produces the build result.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::PushImage | Self::LoadDocker | Self::WriteTarFile)
    }

    /// Human-readable stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PullBaseImage => pull_base_image::NAME,
            Self::PullAndCacheBaseImageLayers => pull_and_cache_base_image_layers::NAME,
            Self::BuildAndCacheApplicationLayers => build_and_cache_application_layers::NAME,
            Self::BuildImage => build_image::NAME,
            Self::RetrieveTargetRegistryCredentials => retrieve_registry_credentials::NAME,
            Self::AuthenticatePush => authenticate_push::NAME,
            Self::PushBaseImageLayers => push_layers::BASE_NAME,
            Self::PushApplicationLayers => push_layers::APPLICATION_NAME,
            Self::PushContainerConfiguration => push_container_configuration::NAME,
            Self::PushImage => push_image::NAME,
            Self::LoadDocker => load_docker::NAME,
            Self::WriteTarFile => write_tar_file::NAME,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct Stage {
    kind: StepKind,
    index: usize,
}

/// Handles of the stages started so far.
#[derive(Default)]
struct Started {
    base_image: Option<StepHandle<BaseImage>>,
    base_layers: Option<StepHandle<LayerSteps>>,
    application_layers: Option<StepHandle<LayerSteps>>,
    image: Option<StepHandle<Image>>,
    credentials: Option<StepHandle<Option<Credential>>>,
    authenticate: Option<StepHandle<()>>,
    base_pushes: Option<StepHandle<PushSteps>>,
    application_pushes: Option<StepHandle<PushSteps>>,
    configuration_push: Option<StepHandle<BlobDescriptor>>,
    result: Option<StepHandle<BuildResult>>,
}

fn started<T>(handle: Option<&StepHandle<T>>, kind: StepKind) -> KilnResult<StepHandle<T>> {
    handle
        .cloned()
        .ok_or_else(|| KilnError::internal(format!("stage '{kind}' was not started")))
}

/// Single-use pipeline of build stages.
#[derive(Debug)]
pub struct StepsRunner {
    ctx: BuildContext,
    stages: Vec<Stage>,
    tar_output: Option<PathBuf>,
}

impl StepsRunner {
    /// A runner with no stages.
    #[must_use]
    pub const fn new(ctx: BuildContext) -> Self {
        Self {
            ctx,
            stages: Vec::new(),
            tar_output: None,
        }
    }

    /// Stages for building and pushing to the target registry.
    #[must_use]
    pub fn for_build_to_registry(ctx: BuildContext) -> Self {
        Self::new(ctx)
            .retrieve_target_registry_credentials(1)
            .authenticate_push(2)
            .pull_base_image(3)
            .pull_and_cache_base_image_layers(4)
            .push_base_image_layers(5)
            .build_and_cache_application_layers(6)
            .build_image(7)
            .push_container_configuration(8)
            .push_application_layers(9)
            .push_image(10)
    }

    /// Stages for building and loading into the docker daemon.
    #[must_use]
    pub fn for_build_to_docker(ctx: BuildContext) -> Self {
        Self::new(ctx)
            .pull_base_image(1)
            .pull_and_cache_base_image_layers(2)
            .build_and_cache_application_layers(3)
            .build_image(4)
            .load_docker(5)
    }

    /// Stages for building and writing a tarball to `output`.
    #[must_use]
    pub fn for_build_to_tar(ctx: BuildContext, output: impl Into<PathBuf>) -> Self {
        Self::new(ctx)
            .pull_base_image(1)
            .pull_and_cache_base_image_layers(2)
            .build_and_cache_application_layers(3)
            .build_image(4)
            .write_tar_file(5, output)
    }

    fn stage(mut self, kind: StepKind, index: usize) -> Self {
        self.stages.push(Stage { kind, index });
        self
    }

    /// Register [`StepKind::PullBaseImage`].
    #[must_use]
    pub fn pull_base_image(self, index: usize) -> Self {
        self.stage(StepKind::PullBaseImage, index)
    }

    /// Register [`StepKind::PullAndCacheBaseImageLayers`].
    #[must_use]
    pub fn pull_and_cache_base_image_layers(self, index: usize) -> Self {
        self.stage(StepKind::PullAndCacheBaseImageLayers, index)
    }

    /// Register [`StepKind::BuildAndCacheApplicationLayers`].
    #[must_use]
    pub fn build_and_cache_application_layers(self, index: usize) -> Self {
        self.stage(StepKind::BuildAndCacheApplicationLayers, index)
    }

    /// Register [`StepKind::BuildImage`].
    #[must_use]
    pub fn build_image(self, index: usize) -> Self {
        self.stage(StepKind::BuildImage, index)
    }

    /// Register [`StepKind::RetrieveTargetRegistryCredentials`].
    #[must_use]
    pub fn retrieve_target_registry_credentials(self, index: usize) -> Self {
        self.stage(StepKind::RetrieveTargetRegistryCredentials, index)
    }

    /// Register [`StepKind::AuthenticatePush`].
    #[must_use]
    pub fn authenticate_push(self, index: usize) -> Self {
        self.stage(StepKind::AuthenticatePush, index)
    }

    /// Register [`StepKind::PushBaseImageLayers`].
    #[must_use]
    pub fn push_base_image_layers(self, index: usize) -> Self {
        self.stage(StepKind::PushBaseImageLayers, index)
    }

    /// Register [`StepKind::PushApplicationLayers`].
    #[must_use]
    pub fn push_application_layers(self, index: usize) -> Self {
        self.stage(StepKind::PushApplicationLayers, index)
    }

    /// Register [`StepKind::PushContainerConfiguration`].
    #[must_use]
    pub fn push_container_configuration(self, index: usize) -> Self {
        self.stage(StepKind::PushContainerConfiguration, index)
    }

    /// Register [`StepKind::PushImage`].
    #[must_use]
    pub fn push_image(self, index: usize) -> Self {
        self.stage(StepKind::PushImage, index)
    }

    /// Register [`StepKind::LoadDocker`].
    #[must_use]
    pub fn load_docker(self, index: usize) -> Self {
        self.stage(StepKind::LoadDocker, index)
    }

    /// Register [`StepKind::WriteTarFile`] writing to `output`.
    #[must_use]
    pub fn write_tar_file(mut self, index: usize, output: impl Into<PathBuf>) -> Self {
        self.tar_output = Some(output.into());
        self.stage(StepKind::WriteTarFile, index)
    }

    /// Registered stages, in order.
    pub fn stages(&self) -> impl Iterator<Item = StepKind> + '_ {
        self.stages.iter().map(|stage| stage.kind)
    }

    fn validate(&self) -> KilnResult<()> {
        let mut seen = Vec::with_capacity(self.stages.len());
        for kind in self.stages() {
            if seen.contains(&kind) {
                return Err(KilnError::config(format!("Stage '{kind}' is registered twice")));
            }
            if let Some(missing) = kind.prerequisites().iter().find(|p| !seen.contains(*p)) {
                return Err(KilnError::config(format!(
                    "Stage '{kind}' requires '{missing}' to be registered before it"
                )));
            }
            seen.push(kind);
        }

        match seen.iter().filter(|kind| kind.is_terminal()).count() {
            1 => Ok(()),
            0 => Err(KilnError::config(
                "No stage produces a build result; register push_image, load_docker or write_tar_file",
            )),
            _ => Err(KilnError::config("Only one of push_image, load_docker or write_tar_file may be registered")),
        }
    }

    /// Run every stage and return the build result.
    ///
    /// # Errors
    ///
    /// Returns a configuration error, before anything starts, for an invalid
    /// stage list. Otherwise returns the first failure reached while waiting
    /// for the terminal stage.
    pub async fn run(self) -> KilnResult<BuildResult> {
        self.validate()?;
        tracing::debug!(stages = ?self.stages().collect::<Vec<_>>(), "Running build stages");

        let events = self.ctx.events().clone();
        let target = self.ctx.config.target_image.full_reference();
        events.lifecycle(format!("Building {target}"));

        let root = ProgressAllocation::root("build", self.stages.len() as u64, events);
        let outcome = self.start_all(&root);
        let result = match outcome {
            Ok(terminal) => terminal.get().await.map_err(|source| KilnError::StepFailed {
                step: terminal.name(),
                source,
            }),
            Err(err) => Err(err),
        };
        root.close();

        match &result {
            Ok(result) => tracing::info!(
                image = %target,
                manifest_digest = %result.manifest_digest,
                "Build finished"
            ),
            Err(err) => tracing::error!(image = %target, error = %err.root_cause(), "Build failed"),
        }
        result
    }

    fn start_all(&self, root: &ProgressAllocation) -> KilnResult<StepHandle<BuildResult>> {
        let ctx = &self.ctx;
        let mut s = Started::default();

        for &Stage { kind, index } in &self.stages {
            let progress = root.allocate(kind.name(), 1, 1)?;
            match kind {
                StepKind::PullBaseImage => {
                    s.base_image = Some(pull_base_image::start(ctx, progress, index));
                }
                StepKind::PullAndCacheBaseImageLayers => {
                    let base = started(s.base_image.as_ref(), StepKind::PullBaseImage)?;
                    s.base_layers = Some(pull_and_cache_base_image_layers::start(
                        ctx, progress, index, base,
                    ));
                }
                StepKind::BuildAndCacheApplicationLayers => {
                    s.application_layers =
                        Some(build_and_cache_application_layers::start(ctx, progress, index));
                }
                StepKind::BuildImage => {
                    s.image = Some(build_image::start(
                        ctx,
                        progress,
                        index,
                        started(s.base_image.as_ref(), StepKind::PullBaseImage)?,
                        started(s.base_layers.as_ref(), StepKind::PullAndCacheBaseImageLayers)?,
                        started(
                            s.application_layers.as_ref(),
                            StepKind::BuildAndCacheApplicationLayers,
                        )?,
                    ));
                }
                StepKind::RetrieveTargetRegistryCredentials => {
                    s.credentials = Some(retrieve_registry_credentials::start(ctx, progress, index));
                }
                StepKind::AuthenticatePush => {
                    let credentials = started(
                        s.credentials.as_ref(),
                        StepKind::RetrieveTargetRegistryCredentials,
                    )?;
                    s.authenticate = Some(authenticate_push::start(ctx, progress, index, credentials));
                }
                StepKind::PushBaseImageLayers => {
                    s.base_pushes = Some(push_layers::start_base(
                        ctx,
                        progress,
                        index,
                        started(s.authenticate.as_ref(), StepKind::AuthenticatePush)?,
                        started(s.base_layers.as_ref(), StepKind::PullAndCacheBaseImageLayers)?,
                    ));
                }
                StepKind::PushApplicationLayers => {
                    s.application_pushes = Some(push_layers::start_application(
                        ctx,
                        progress,
                        index,
                        started(s.authenticate.as_ref(), StepKind::AuthenticatePush)?,
                        started(
                            s.application_layers.as_ref(),
                            StepKind::BuildAndCacheApplicationLayers,
                        )?,
                    ));
                }
                StepKind::PushContainerConfiguration => {
                    s.configuration_push = Some(push_container_configuration::start(
                        ctx,
                        progress,
                        index,
                        started(s.authenticate.as_ref(), StepKind::AuthenticatePush)?,
                        started(s.image.as_ref(), StepKind::BuildImage)?,
                    ));
                }
                StepKind::PushImage => {
                    let blobs = PushedBlobs {
                        base_layers: started(s.base_pushes.as_ref(), StepKind::PushBaseImageLayers)?,
                        application_layers: started(
                            s.application_pushes.as_ref(),
                            StepKind::PushApplicationLayers,
                        )?,
                        container_configuration: started(
                            s.configuration_push.as_ref(),
                            StepKind::PushContainerConfiguration,
                        )?,
                    };
                    s.result = Some(push_image::start(
                        ctx,
                        progress,
                        index,
                        started(s.authenticate.as_ref(), StepKind::AuthenticatePush)?,
                        blobs,
                        started(s.image.as_ref(), StepKind::BuildImage)?,
                    ));
                }
                StepKind::LoadDocker => {
                    let image = started(s.image.as_ref(), StepKind::BuildImage)?;
                    s.result = Some(load_docker::start(ctx, progress, index, image));
                }
                StepKind::WriteTarFile => {
                    let image = started(s.image.as_ref(), StepKind::BuildImage)?;
                    let output = self
                        .tar_output
                        .clone()
                        .ok_or_else(|| KilnError::config("write_tar_file needs an output path"))?;
                    s.result = Some(write_tar_file::start(ctx, progress, index, image, output));
                }
            }
        }

        s.result
            .ok_or_else(|| KilnError::internal("no terminal stage was started"))
    }
}

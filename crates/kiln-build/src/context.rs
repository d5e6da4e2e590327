//! Shared state handed to every build step.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_common::{KilnError, KilnResult};
use kiln_image::{
    CredentialChain, CredentialRetriever, DockerClient, DockerDaemon, LayerCache, RegistryClient,
    RegistryTransport,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BuildConfiguration;
use crate::events::EventHandlers;

/// External services a build talks to.
pub struct Collaborators {
    /// Registry holding the base image.
    pub base_registry: Arc<dyn RegistryTransport>,
    /// Registry receiving the target image.
    pub target_registry: Arc<dyn RegistryTransport>,
    /// Source of registry credentials not given in the configuration.
    pub credentials: Arc<dyn CredentialRetriever>,
    /// Local docker daemon.
    pub docker: Arc<dyn DockerDaemon>,
}

impl Collaborators {
    /// Real registry clients, the standard credential chain and the `docker` CLI.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if an HTTP client cannot be built.
    pub fn from_config(config: &BuildConfiguration) -> KilnResult<Self> {
        Ok(Self {
            base_registry: Arc::new(RegistryClient::new(
                &config.base_image,
                config.transport.clone(),
            )?),
            target_registry: Arc::new(RegistryClient::new(
                &config.target_image,
                config.transport.clone(),
            )?),
            credentials: Arc::new(CredentialChain::standard()),
            docker: Arc::new(DockerClient::new(DockerClient::DEFAULT_EXECUTABLE, HashMap::new())),
        })
    }

    /// Replace the docker daemon.
    #[must_use]
    pub fn with_docker(mut self, docker: Arc<dyn DockerDaemon>) -> Self {
        self.docker = docker;
        self
    }
}

/// Everything steps share during one build.
#[derive(Clone)]
pub struct BuildContext {
    /// Build settings.
    pub config: Arc<BuildConfiguration>,
    /// Cache of pulled base layers and base image metadata.
    pub base_cache: LayerCache,
    /// Cache of built application layers.
    pub application_cache: LayerCache,
    /// Registry holding the base image.
    pub base_registry: Arc<dyn RegistryTransport>,
    /// Registry receiving the target image.
    pub target_registry: Arc<dyn RegistryTransport>,
    /// Credential source.
    pub credentials: Arc<dyn CredentialRetriever>,
    /// Local docker daemon.
    pub docker: Arc<dyn DockerDaemon>,
    transfers: Arc<Semaphore>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("target_image", &self.config.target_image)
            .field("base_image", &self.config.base_image)
            .finish_non_exhaustive()
    }
}

impl BuildContext {
    /// Open the caches named by `config` and wire in `collaborators`.
    ///
    /// # Errors
    ///
    /// Returns an error if a cache directory cannot be opened.
    pub fn new(config: BuildConfiguration, collaborators: Collaborators) -> KilnResult<Self> {
        let base_cache = LayerCache::open(&config.base_layers_cache)?;
        let application_cache = LayerCache::open(&config.application_layers_cache)?;
        let transfers = Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1)));
        Ok(Self {
            config: Arc::new(config),
            base_cache,
            application_cache,
            base_registry: collaborators.base_registry,
            target_registry: collaborators.target_registry,
            credentials: collaborators.credentials,
            docker: collaborators.docker,
            transfers,
        })
    }

    /// Build with real collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if a cache or HTTP client cannot be set up.
    pub fn from_config(config: BuildConfiguration) -> KilnResult<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::new(config, collaborators)
    }

    /// Event receivers.
    #[must_use]
    pub fn events(&self) -> &EventHandlers {
        &self.config.events
    }

    /// Wait for a blob transfer slot. Hold the permit only around the transfer.
    ///
    /// # Errors
    ///
    /// Fails only if the semaphore was closed.
    pub async fn transfer_permit(&self) -> KilnResult<OwnedSemaphorePermit> {
        Arc::clone(&self.transfers)
            .acquire_owned()
            .await
            .map_err(|e| KilnError::internal(format!("transfer semaphore closed: {e}")))
    }
}

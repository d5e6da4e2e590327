//! Immutable build settings shared by every step.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_common::{KilnError, KilnPaths, KilnResult};
use kiln_image::reference::ImageTag;
use kiln_image::{Credential, ImageReference, LayerConfiguration, TransportConfig};
use kiln_oci::ImageFormat;
use kiln_oci::image::EmptyObject;

use crate::events::EventHandlers;

/// Default bound on simultaneous blob transfers.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 8;

/// Container execution settings applied on top of the base image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Entrypoint; replaces the base image's entrypoint and command.
    pub entrypoint: Option<Vec<String>>,
    /// Command arguments.
    pub cmd: Option<Vec<String>>,
    /// Environment variables, merged over the base image's by name.
    pub environment: BTreeMap<String, String>,
    /// Working directory (absolute).
    pub working_directory: Option<String>,
    /// User (and optionally group) to run as.
    pub user: Option<String>,
    /// Exposed ports such as `8080`, `53/udp` or `1000-1002/tcp`.
    pub ports: Vec<String>,
    /// Volume mount points (absolute).
    pub volumes: Vec<String>,
    /// Labels, merged over the base image's by key.
    pub labels: BTreeMap<String, String>,
}

impl ContainerSettings {
    /// Exposed ports in `<port>/<protocol>` form, ranges expanded.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed ports or protocols.
    pub fn exposed_ports(&self) -> KilnResult<BTreeMap<String, EmptyObject>> {
        let mut exposed = BTreeMap::new();
        for spec in &self.ports {
            let invalid = || KilnError::config(format!("Invalid port specification: {spec}"));
            let (range, protocol) = spec.split_once('/').unwrap_or((spec, "tcp"));
            if !matches!(protocol, "tcp" | "udp" | "sctp") {
                return Err(invalid());
            }
            let (start, end) = match range.split_once('-') {
                Some((start, end)) => (start, end),
                None => (range, range),
            };
            let start: u16 = start.trim().parse().map_err(|_| invalid())?;
            let end: u16 = end.trim().parse().map_err(|_| invalid())?;
            if start == 0 || end < start {
                return Err(invalid());
            }
            for port in start..=end {
                exposed.insert(format!("{port}/{protocol}"), EmptyObject {});
            }
        }
        Ok(exposed)
    }

    fn validate(&self) -> KilnResult<()> {
        self.exposed_ports()?;
        for volume in &self.volumes {
            if !volume.starts_with('/') {
                return Err(KilnError::config(format!(
                    "Volume must be an absolute path: {volume}"
                )));
            }
        }
        if let Some(dir) = &self.working_directory {
            if !dir.starts_with('/') {
                return Err(KilnError::config(format!(
                    "Working directory must be an absolute path: {dir}"
                )));
            }
        }
        if let Some(name) = self.environment.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(KilnError::config(format!(
                "Invalid environment variable name: '{name}'"
            )));
        }
        Ok(())
    }
}

/// Everything a build needs to know, fixed before the first step starts.
#[derive(Debug, Clone)]
pub struct BuildConfiguration {
    /// Image to build on; `scratch` for none.
    pub base_image: ImageReference,
    /// Image to produce.
    pub target_image: ImageReference,
    /// Tags applied in addition to the target image's own tag.
    pub additional_tags: Vec<String>,
    /// Manifest flavor to produce.
    pub format: ImageFormat,
    /// Application layers, bottom first.
    pub layers: Vec<LayerConfiguration>,
    /// Execution settings.
    pub container: ContainerSettings,
    /// Cache for pulled base image layers.
    pub base_layers_cache: PathBuf,
    /// Cache for built application layers.
    pub application_layers_cache: PathBuf,
    /// Normalize timestamps so identical inputs give identical digests.
    pub reproducible: bool,
    /// Resolve the base image from the cache only.
    pub offline: bool,
    /// HTTP settings for registry access.
    pub transport: TransportConfig,
    /// Maximum number of simultaneous blob transfers.
    pub max_concurrent_transfers: usize,
    /// Credential for the base image registry.
    pub base_credential: Option<Credential>,
    /// Credential for the target image registry.
    pub target_credential: Option<Credential>,
    /// Receivers of progress and log events.
    pub events: EventHandlers,
}

impl BuildConfiguration {
    /// Start configuring a build of `target_image` on top of `base_image`.
    #[must_use]
    pub fn builder(base_image: ImageReference, target_image: ImageReference) -> BuildConfigurationBuilder {
        let paths = KilnPaths::new();
        BuildConfigurationBuilder {
            config: Self {
                base_image,
                target_image,
                additional_tags: Vec::new(),
                format: ImageFormat::Docker,
                layers: Vec::new(),
                container: ContainerSettings::default(),
                base_layers_cache: paths.base_layers_cache(),
                application_layers_cache: paths.application_layers_cache(),
                reproducible: true,
                offline: false,
                transport: TransportConfig::default(),
                max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
                base_credential: None,
                target_credential: None,
                events: EventHandlers::none(),
            },
        }
    }

    /// Every tag the target image is published under, its own tag first.
    #[must_use]
    pub fn all_tags(&self) -> Vec<String> {
        let mut tags = vec![self.target_image.tag_or_digest().to_string()];
        for tag in &self.additional_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }
}

/// Builder for [`BuildConfiguration`].
#[derive(Debug)]
pub struct BuildConfigurationBuilder {
    config: BuildConfiguration,
}

impl BuildConfigurationBuilder {
    /// Tags applied in addition to the target tag.
    #[must_use]
    pub fn additional_tags(mut self, tags: Vec<String>) -> Self {
        self.config.additional_tags = tags;
        self
    }

    /// Manifest flavor.
    #[must_use]
    pub const fn format(mut self, format: ImageFormat) -> Self {
        self.config.format = format;
        self
    }

    /// Append an application layer.
    #[must_use]
    pub fn layer(mut self, layer: LayerConfiguration) -> Self {
        self.config.layers.push(layer);
        self
    }

    /// Execution settings.
    #[must_use]
    pub fn container(mut self, container: ContainerSettings) -> Self {
        self.config.container = container;
        self
    }

    /// Cache locations for base and application layers.
    #[must_use]
    pub fn caches(mut self, base: impl Into<PathBuf>, application: impl Into<PathBuf>) -> Self {
        self.config.base_layers_cache = base.into();
        self.config.application_layers_cache = application.into();
        self
    }

    /// Reproducible mode.
    #[must_use]
    pub const fn reproducible(mut self, reproducible: bool) -> Self {
        self.config.reproducible = reproducible;
        self
    }

    /// Offline mode.
    #[must_use]
    pub const fn offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    /// HTTP settings.
    #[must_use]
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Bound on simultaneous blob transfers.
    #[must_use]
    pub const fn max_concurrent_transfers(mut self, max: usize) -> Self {
        self.config.max_concurrent_transfers = max;
        self
    }

    /// Credential for the base image registry.
    #[must_use]
    pub fn base_credential(mut self, credential: Option<Credential>) -> Self {
        self.config.base_credential = credential;
        self
    }

    /// Credential for the target image registry.
    #[must_use]
    pub fn target_credential(mut self, credential: Option<Credential>) -> Self {
        self.config.target_credential = credential;
        self
    }

    /// Event receivers.
    #[must_use]
    pub fn events(mut self, events: EventHandlers) -> Self {
        self.config.events = events;
        self
    }

    /// Validate and produce the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid setting.
    pub fn build(self) -> KilnResult<BuildConfiguration> {
        let config = self.config;

        if config.target_image.is_scratch() {
            return Err(KilnError::config("Target image cannot be 'scratch'"));
        }
        if let ImageTag::Digest(digest) = &config.target_image.reference {
            return Err(KilnError::config(format!(
                "Target image must be tagged, not pinned to {digest}"
            )));
        }
        for tag in &config.additional_tags {
            if !is_valid_tag(tag) {
                return Err(KilnError::config(format!("Invalid tag: '{tag}'")));
            }
        }
        if config.max_concurrent_transfers == 0 {
            return Err(KilnError::config("max_concurrent_transfers must be at least 1"));
        }
        let mut names = std::collections::HashSet::new();
        for layer in &config.layers {
            if !names.insert(layer.name.as_str()) {
                return Err(KilnError::config(format!(
                    "Duplicate layer name: '{}'",
                    layer.name
                )));
            }
        }
        config.container.validate()?;

        Ok(config)
    }
}

/// Docker tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        && tag.len() <= 128
        && chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
}

//! Build file parsing.
//!
//! A build file describes one image build in YAML, TOML or JSON:
//!
//! ```yaml
//! base_image: gcr.io/distroless/cc
//! target_image: ghcr.io/org/app:v1
//! target_tags: [latest]
//! image_layers_folder: ./dist/app
//! entrypoint: ["/app/server"]
//! ports: ["8080"]
//! ```
//!
//! Relative paths are resolved against the directory holding the build file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_common::{KilnError, KilnResult};
use kiln_image::{Credential, ImageReference, LayerConfiguration, LayerEntry, TransportConfig};
use kiln_oci::ImageFormat;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::{BuildConfiguration, ContainerSettings};
use crate::events::EventHandlers;

/// Name of the layer built from `image_layers_folder`.
pub const FOLDER_LAYER_NAME: &str = "Binary";

/// Default HTTP timeout in milliseconds.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 600_000;

/// An image build as written by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildFile {
    /// Base image reference; `scratch` for none.
    pub base_image: String,

    /// Credential for the base image registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image_credential: Option<Credential>,

    /// Target image reference.
    pub target_image: String,

    /// Credential for the target image registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_image_credential: Option<Credential>,

    /// Extra tags for the target image.
    #[serde(default)]
    pub target_tags: Vec<String>,

    /// Manifest flavor.
    #[serde(default)]
    pub image_format: ImageFormat,

    /// Folder whose files become the `Binary` layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_layers_folder: Option<PathBuf>,

    /// Explicit layers, stacked after the folder layer.
    #[serde(default)]
    pub layers: Vec<LayerSpec>,

    /// Entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    /// Command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    /// Environment variables.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    /// User.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Exposed ports.
    #[serde(default)]
    pub ports: Vec<String>,

    /// Volumes.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Application layer cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_layers_cache_directory: Option<PathBuf>,

    /// Base layer cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_layers_cache_directory: Option<PathBuf>,

    /// Normalize timestamps for reproducible digests.
    #[serde(default = "default_true")]
    pub reproducible_build: bool,

    /// Allow plain HTTP and unverified TLS.
    #[serde(default)]
    pub allow_insecure_registries: bool,

    /// Send credentials over plain HTTP.
    #[serde(default)]
    pub send_credentials_over_http: bool,

    /// Build without network access to the base registry.
    #[serde(default)]
    pub offline_mode: bool,

    /// Proxy URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,

    /// HTTP timeout in milliseconds; 0 waits forever.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Run one blob transfer at a time.
    #[serde(default)]
    pub serialize: bool,
}

/// An explicitly listed layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer name.
    pub name: String,
    /// Files to include.
    pub entries: Vec<EntrySpec>,
}

/// One file of an explicit layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    /// Host path.
    pub source: PathBuf,
    /// Absolute path in the image.
    pub destination: String,
}

const fn default_true() -> bool {
    true
}

const fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

impl BuildFile {
    /// Parse from any supported format (auto-detected by extension).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            KilnError::config(format!("Failed to read build file {}: {e}", path.display()))
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse from YAML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on malformed input.
    pub fn from_yaml(content: &str) -> KilnResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| KilnError::config(format!("Failed to parse YAML build file: {e}")))
    }

    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on malformed input.
    pub fn from_toml(content: &str) -> KilnResult<Self> {
        toml::from_str(content)
            .map_err(|e| KilnError::config(format!("Failed to parse TOML build file: {e}")))
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on malformed input.
    pub fn from_json(content: &str) -> KilnResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| KilnError::config(format!("Failed to parse JSON build file: {e}")))
    }

    /// HTTP settings described by this file.
    #[must_use]
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            timeout: (self.http_timeout_ms > 0).then(|| Duration::from_millis(self.http_timeout_ms)),
            proxy: self.http_proxy.clone(),
            allow_insecure: self.allow_insecure_registries,
            send_credentials_over_http: self.send_credentials_over_http,
            ..TransportConfig::default()
        }
    }

    /// Validate and turn into a [`BuildConfiguration`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid references, missing layer
    /// folders, relative destinations or invalid container settings.
    pub fn into_configuration(
        self,
        base_dir: &Path,
        events: EventHandlers,
    ) -> KilnResult<BuildConfiguration> {
        if self.base_image.trim().is_empty() {
            return Err(KilnError::config("base_image is required"));
        }
        if self.target_image.trim().is_empty() {
            return Err(KilnError::config("target_image is required"));
        }
        let base_image = ImageReference::parse(&self.base_image)?;
        let target_image = ImageReference::parse(&self.target_image)?;
        let transport = self.transport();

        let mut layers = Vec::new();
        if let Some(folder) = &self.image_layers_folder {
            layers.push(folder_layer(&base_dir.join(folder))?);
        }
        for spec in self.layers {
            let entries = spec
                .entries
                .into_iter()
                .map(|entry| LayerEntry::new(base_dir.join(entry.source), entry.destination))
                .collect::<KilnResult<Vec<_>>>()?;
            layers.push(LayerConfiguration::new(spec.name, entries));
        }

        let container = ContainerSettings {
            entrypoint: self.entrypoint,
            cmd: self.cmd,
            environment: self.environment,
            working_directory: self.working_directory,
            user: self.user,
            ports: self.ports,
            volumes: self.volumes,
            labels: self.labels,
        };

        let mut builder = BuildConfiguration::builder(base_image, target_image)
            .additional_tags(self.target_tags)
            .format(self.image_format)
            .container(container)
            .reproducible(self.reproducible_build)
            .offline(self.offline_mode)
            .transport(transport)
            .base_credential(self.base_image_credential)
            .target_credential(self.target_image_credential)
            .events(events);
        if self.serialize {
            builder = builder.max_concurrent_transfers(1);
        }
        for layer in layers {
            builder = builder.layer(layer);
        }

        let mut config = builder.build()?;
        if let Some(dir) = self.base_layers_cache_directory {
            config.base_layers_cache = base_dir.join(dir);
        }
        if let Some(dir) = self.application_layers_cache_directory {
            config.application_layers_cache = base_dir.join(dir);
        }
        Ok(config)
    }
}

/// Every file below `folder`, placed at `/` + its path relative to the
/// folder's parent.
fn folder_layer(folder: &Path) -> KilnResult<LayerConfiguration> {
    if !folder.is_dir() {
        return Err(KilnError::config(format!(
            "image_layers_folder not found: {}",
            folder.display()
        )));
    }
    let root = folder.parent().unwrap_or(folder);

    let mut entries = Vec::new();
    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            KilnError::config(format!("Failed to walk {}: {e}", folder.display()))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).map_err(|e| {
            KilnError::internal(format!("{} escapes {}: {e}", entry.path().display(), root.display()))
        })?;
        let destination = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(LayerEntry::new(entry.path(), format!("/{destination}"))?);
    }
    tracing::debug!(folder = %folder.display(), files = entries.len(), "Collected layer folder");

    Ok(LayerConfiguration::new(FOLDER_LAYER_NAME, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
base_image: alpine:3.19
target_image: ghcr.io/org/app:v1
target_tags: [latest]
image_format: oci
entrypoint: ["/app/server"]
environment:
  RUST_LOG: info
ports: ["8080"]
"#;

    #[test]
    fn yaml_defaults() {
        let file = BuildFile::from_yaml(YAML).unwrap();
        assert_eq!(file.image_format, ImageFormat::Oci);
        assert!(file.reproducible_build);
        assert_eq!(file.http_timeout_ms, DEFAULT_HTTP_TIMEOUT_MS);
        assert_eq!(file.transport().timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let file = BuildFile {
            http_timeout_ms: 0,
            ..BuildFile::default()
        };
        assert_eq!(file.transport().timeout, None);
    }

    #[test]
    fn formats_agree() {
        let toml = r#"
base_image = "alpine:3.19"
target_image = "ghcr.io/org/app:v1"
target_tags = ["latest"]
image_format = "oci"
"#;
        let json = r#"{"base_image":"alpine:3.19","target_image":"ghcr.io/org/app:v1","target_tags":["latest"],"image_format":"oci"}"#;
        let from_toml = BuildFile::from_toml(toml).unwrap();
        let from_json = BuildFile::from_json(json).unwrap();
        assert_eq!(from_toml.target_tags, from_json.target_tags);
        assert_eq!(from_toml.image_format, from_json.image_format);
        assert_eq!(from_toml.reproducible_build, from_json.reproducible_build);
    }

    #[test]
    fn from_file_picks_parser_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.json");
        fs::write(&path, r#"{"base_image":"scratch","target_image":"app"}"#).unwrap();
        let file = BuildFile::from_file(&path).unwrap();
        assert_eq!(file.base_image, "scratch");

        let missing = BuildFile::from_file(&dir.path().join("absent.yaml"));
        assert!(matches!(missing, Err(KilnError::Config { .. })));
    }

    #[test]
    fn folder_becomes_binary_layer() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("dist").join("app");
        fs::create_dir_all(app.join("bin")).unwrap();
        fs::write(app.join("bin").join("server"), b"binary").unwrap();
        fs::write(app.join("config.toml"), b"port = 8080").unwrap();

        let file = BuildFile {
            image_layers_folder: Some(PathBuf::from("dist/app")),
            ..BuildFile::from_yaml(YAML).unwrap()
        };
        let config = file.into_configuration(dir.path(), EventHandlers::none()).unwrap();

        assert_eq!(config.layers.len(), 1);
        assert_eq!(config.layers[0].name, FOLDER_LAYER_NAME);
        let destinations: Vec<_> = config.layers[0]
            .entries
            .iter()
            .map(|e| e.destination.as_str())
            .collect();
        assert_eq!(destinations, vec!["/app/bin/server", "/app/config.toml"]);
        assert_eq!(config.additional_tags, vec!["latest"]);
        assert_eq!(config.container.environment["RUST_LOG"], "info");
    }

    #[test]
    fn missing_folder_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = BuildFile {
            image_layers_folder: Some(PathBuf::from("nope")),
            ..BuildFile::from_yaml(YAML).unwrap()
        };
        assert!(matches!(
            file.into_configuration(dir.path(), EventHandlers::none()),
            Err(KilnError::Config { .. })
        ));
    }

    #[test]
    fn relative_destinations_are_rejected() {
        let file = BuildFile {
            layers: vec![LayerSpec {
                name: "assets".to_string(),
                entries: vec![EntrySpec {
                    source: PathBuf::from("logo.png"),
                    destination: "static/logo.png".to_string(),
                }],
            }],
            ..BuildFile::from_yaml(YAML).unwrap()
        };
        assert!(file.into_configuration(Path::new("."), EventHandlers::none()).is_err());
    }

    #[test]
    fn serialize_limits_transfers_and_caches_resolve_relative() {
        let dir = tempfile::tempdir().unwrap();
        let file = BuildFile {
            serialize: true,
            base_layers_cache_directory: Some(PathBuf::from("cache/base")),
            ..BuildFile::from_yaml(YAML).unwrap()
        };
        let config = file.into_configuration(dir.path(), EventHandlers::none()).unwrap();
        assert_eq!(config.max_concurrent_transfers, 1);
        assert_eq!(config.base_layers_cache, dir.path().join("cache/base"));
    }
}

//! Standard filesystem paths for Kiln.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Kiln caches.
pub static KILN_CACHE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KILN_CACHE_DIR").map_or_else(
        |_| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("kiln")
        },
        PathBuf::from,
    )
});

/// Standard paths used by the Kiln builder.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    /// Cache root directory (default: `<user cache dir>/kiln`).
    pub root: PathBuf,
}

impl KilnPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache for pulled base image layers and manifests.
    #[must_use]
    pub fn base_layers_cache(&self) -> PathBuf {
        self.root.join("base-layers")
    }

    /// Cache for built application layers.
    #[must_use]
    pub fn application_layers_cache(&self) -> PathBuf {
        self.root.join("application-layers")
    }

    /// Docker CLI configuration file (`~/.docker/config.json`).
    #[must_use]
    pub fn docker_config() -> PathBuf {
        std::env::var("DOCKER_CONFIG").map_or_else(
            |_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".docker")
                    .join("config.json")
            },
            |dir| PathBuf::from(dir).join("config.json"),
        )
    }
}

impl Default for KilnPaths {
    fn default() -> Self {
        Self {
            root: KILN_CACHE_DIR.clone(),
        }
    }
}

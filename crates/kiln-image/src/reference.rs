//! Image reference parsing.

use std::fmt;
use std::str::FromStr;

use kiln_common::{KilnError, KilnResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";
    /// Name of the empty base image.
    pub const SCRATCH: &'static str = "scratch";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `localhost:5000/app` -> localhost:5000/app:latest
    /// - `ghcr.io/org/app:v1.0` -> ghcr.io/org/app:v1.0
    ///
    /// # Errors
    ///
    /// Returns an error for empty references, empty tags or bad characters.
    pub fn parse(reference: &str) -> KilnResult<Self> {
        let reference = reference.trim();
        let invalid = || KilnError::InvalidReference {
            reference: reference.to_string(),
        };

        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        // Check for digest
        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            (name, ImageTag::Digest(digest.to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // A colon followed by a slash belongs to a registry port
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                (&reference[..idx], ImageTag::Tag(potential_tag.to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        if name.is_empty() || matches!(&tag, ImageTag::Tag(t) | ImageTag::Digest(t) if t.is_empty())
        {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            // Looks like a registry if it has dots, a port, or is localhost
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None if name == Self::SCRATCH => (String::new(), name.to_string()),
            // Official image (e.g., "alpine" -> "library/alpine")
            None => (Self::DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };

        if repository.is_empty()
            || !repository
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c))
        {
            return Err(invalid());
        }

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Whether this is the empty `scratch` base image.
    #[must_use]
    pub fn is_scratch(&self) -> bool {
        self.registry.is_empty() && self.repository == Self::SCRATCH
    }

    /// Tag or digest string used in registry API paths.
    #[must_use]
    pub fn tag_or_digest(&self) -> &str {
        match &self.reference {
            ImageTag::Tag(t) | ImageTag::Digest(t) => t,
        }
    }

    /// The same repository with a different tag.
    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: ImageTag::Tag(tag.into()),
        }
    }

    /// Host that serves the registry API (Docker Hub is special-cased).
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == Self::DEFAULT_REGISTRY {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        if self.is_scratch() {
            return Self::SCRATCH.to_string();
        }
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

impl FromStr for ImageReference {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

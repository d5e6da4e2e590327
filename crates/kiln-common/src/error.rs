//! Common error types for the Kiln image builder.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Errors raised while building, caching or transferring images.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// A pulled blob did not hash to the digest the manifest declared.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(kiln::blob::integrity),
        help("The registry served corrupted or tampered content; the blob was not cached")
    )]
    Integrity {
        /// Digest declared by the manifest.
        expected: String,
        /// Digest computed from the received bytes.
        actual: String,
    },

    /// Transient network failure. The transport retries these itself.
    #[error("Network error: {message}")]
    #[diagnostic(code(kiln::network))]
    Network {
        /// The error message.
        message: String,
    },

    /// The transport gave up on a transient failure.
    #[error("Giving up after {attempts} attempts")]
    #[diagnostic(
        code(kiln::network::retries_exhausted),
        help("Check connectivity to the registry or raise the HTTP timeout")
    )]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last transient failure.
        #[source]
        source: Box<KilnError>,
    },

    /// Non-retryable registry response.
    #[error("Registry error ({status}): {message}")]
    #[diagnostic(code(kiln::registry))]
    Registry {
        /// HTTP status code.
        status: u16,
        /// The error message.
        message: String,
    },

    /// Reading or writing a cache entry failed.
    #[error("Cache I/O error at {}: {source}", path.display())]
    #[diagnostic(
        code(kiln::cache::io),
        help("Check free space and permissions of the cache directory")
    )]
    CacheIo {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A cache entry exists but cannot be interpreted.
    #[error("Cache entry corrupted: {message}")]
    #[diagnostic(code(kiln::cache::corrupted), help("Run `kiln cache clear` and rebuild"))]
    CacheCorrupted {
        /// The error message.
        message: String,
    },

    /// Registry rejected the supplied credentials.
    #[error("Authentication failed for {registry}: {message}")]
    #[diagnostic(
        code(kiln::auth),
        help("Provide different credentials in the build file or docker config")
    )]
    Authentication {
        /// Registry host.
        registry: String,
        /// The error message.
        message: String,
    },

    /// Image not found in the registry or local store.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(kiln::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Invalid image reference.
    #[error("Invalid image reference: {reference}")]
    #[diagnostic(
        code(kiln::image::invalid_reference),
        help("Use formats like 'alpine', 'alpine:3.19' or 'ghcr.io/org/app:v1'")
    )]
    InvalidReference {
        /// The invalid reference.
        reference: String,
    },

    /// Invalid digest string.
    #[error("Invalid digest: {value}")]
    #[diagnostic(
        code(kiln::digest::invalid),
        help("Digests look like 'sha256:' followed by 64 lowercase hex characters")
    )]
    InvalidDigest {
        /// The invalid value.
        value: String,
    },

    /// Interaction with the docker CLI failed.
    #[error("Docker error: {message}")]
    #[diagnostic(code(kiln::docker), help("Make sure the docker CLI is installed and the daemon is running"))]
    Docker {
        /// The error message.
        message: String,
    },

    /// A prerequisite build step failed.
    #[error("Step '{step}' failed: {source}")]
    #[diagnostic(code(kiln::step))]
    StepFailed {
        /// Name of the step that observed the failure.
        step: &'static str,
        /// The failure of the prerequisite.
        #[source]
        source: Arc<KilnError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(kiln::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/kiln/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KilnError {
    /// Shorthand for a [`KilnError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a [`KilnError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap an I/O error as a cache failure at `path`.
    pub fn cache_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CacheIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the transport should retry the operation that produced this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Follow [`KilnError::StepFailed`] wrappers down to the originating failure.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::StepFailed { source, .. } = current {
            current = source;
        }
        current
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KilnError::Integrity {
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Digest mismatch: expected sha256:aaa, got sha256:bbb"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KilnError = io_err.into();
        assert!(matches!(err, KilnError::Io(_)));
    }

    #[test]
    fn root_cause_unwraps_step_chain() {
        let inner = Arc::new(KilnError::Authentication {
            registry: "ghcr.io".to_string(),
            message: "denied".to_string(),
        });
        let middle = Arc::new(KilnError::StepFailed {
            step: "authenticate push",
            source: inner,
        });
        let outer = KilnError::StepFailed {
            step: "push image",
            source: middle,
        };
        assert!(matches!(
            outer.root_cause(),
            KilnError::Authentication { registry, .. } if registry == "ghcr.io"
        ));
    }

    #[test]
    fn only_network_errors_retry() {
        assert!(
            KilnError::Network {
                message: "reset".to_string()
            }
            .is_retryable()
        );
        assert!(!KilnError::config("bad").is_retryable());
    }
}

//! # kiln-image
//!
//! Image building blocks for Kiln.
//!
//! This crate provides:
//! - Image reference parsing
//! - Reproducible application layers and the content-addressable layer cache
//! - Registry transport with retries and token authentication
//! - Registry credential retrieval
//! - Docker daemon access and `docker load` tarballs

#![warn(missing_docs)]

pub mod blob;
pub mod cache;
pub mod credentials;
pub mod docker;
pub mod image;
pub mod layer;
pub mod reference;
/// Image registry client.
pub mod registry;
pub mod tarball;

pub use cache::{CachedLayer, ImageMetadata, LayerCache};
pub use credentials::{Credential, CredentialChain, CredentialRetriever};
pub use docker::{DockerClient, DockerDaemon};
pub use image::Image;
pub use layer::{Layer, LayerConfiguration, LayerEntry};
pub use reference::ImageReference;
pub use registry::{AuthScope, RegistryClient, RegistryTransport, TransportConfig};
pub use tarball::ImageTarball;

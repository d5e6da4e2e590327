//! # kiln-oci
//!
//! Image specification types for Kiln.
//!
//! This crate provides Rust types for:
//! - Docker V2.2 and OCI image manifests
//! - Manifest lists / image indexes
//! - Container configuration (the image config blob)
//! - The `manifest.json` of `docker load` tarballs

#![warn(missing_docs)]

pub mod image;

pub use image::{
    ContainerConfiguration, Descriptor, ImageFormat, ImageIndex, ImageManifest, PulledManifest,
};

//! # kiln-common
//!
//! Shared utilities and types for the Kiln image builder.
//!
//! This crate provides common functionality used across all Kiln crates:
//! - Content digests and digest-computing writers
//! - Standard cache and configuration paths
//! - The common error taxonomy

#![warn(missing_docs)]

pub mod digest;
pub mod error;
pub mod paths;

pub use digest::{BlobDescriptor, Digest, DigestWriter};
pub use error::{KilnError, KilnResult};
pub use paths::KilnPaths;

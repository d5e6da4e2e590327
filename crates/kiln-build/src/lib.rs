//! # kiln-build
//!
//! Build pipeline for Kiln, a daemonless container image builder.
//!
//! A build is a graph of eagerly started steps: pull the base image, pull and
//! cache its layers, build and cache the application layers, assemble the
//! image, then push it to a registry, load it into docker or write a tarball.
//! [`StepsRunner`] wires the steps together and waits for the result.

#![warn(missing_docs)]

pub mod buildfile;
pub mod cli;
pub mod config;
pub mod context;
pub mod events;
pub mod progress;
pub mod result;
pub mod runner;
pub mod step;
pub mod steps;
pub mod ui;

pub use buildfile::BuildFile;
pub use config::{BuildConfiguration, BuildConfigurationBuilder, ContainerSettings};
pub use context::{BuildContext, Collaborators};
pub use events::{BuildEvent, EventBus, EventHandlers, EventSink, LogLevel, NoopSink};
pub use progress::ProgressAllocation;
pub use result::BuildResult;
pub use runner::{StepKind, StepsRunner};
pub use step::StepHandle;

//! Image build engines for Shipyard.
//!
//! Provides `BuildEngine` implementations:
//! - Local Docker daemon (via bollard)
//! - A retrying wrapper around any other engine

pub mod docker;
pub mod retry;

pub use docker::DockerEngine;
pub use retry::{RetryEngine, RetryPolicy};
pub use shipyard_core::engine::{
    BuildEngine, BuildRequest, BuiltImage, ImageRef, PruneStats, Registry, RemoveOutcome,
};

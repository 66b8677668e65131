//! Core domain types and traits for Shipyard.
//!
//! This crate contains:
//! - Job identifiers, statuses and records
//! - Image descriptors and build context assembly
//! - The `BuildEngine` trait (login/build/push/cleanup against an image builder)
//! - The `MetadataStore` trait (persistence of job records)

pub mod engine;
pub mod error;
pub mod id;
pub mod image;
pub mod job;
pub mod store;

pub use engine::{BuildEngine, BuildRequest, BuiltImage, ImageRef, PruneStats, Registry, RemoveOutcome};
pub use error::{Error, Result};
pub use id::JobId;
pub use image::{BuildOptions, ImageSpec, Layer};
pub use job::{JobRecord, JobSpec, JobStatus, StepResult};
pub use store::MetadataStore;

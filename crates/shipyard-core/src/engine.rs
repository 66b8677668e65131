//! Build engine trait and its request/response types.
//!
//! A build engine logs into registries, builds images from an in-memory
//! context, pushes them, and cleans up local images and build cache.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;
use crate::image::BuildOptions;

/// Destination registry and its credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("uri", &self.uri)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Everything needed to build one image.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Tag applied to the result (`name:tag`).
    pub tag: String,
    /// Path of the Dockerfile inside the context.
    pub dockerfile: String,
    /// Tar archive holding the Dockerfile.
    pub context: Bytes,
    pub options: BuildOptions,
    /// Labels applied on top of `options.labels`.
    pub labels: HashMap<String, String>,
}

/// A successfully built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub id: String,
    pub tag: String,
    pub size_bytes: u64,
}

/// A local image known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub tags: Vec<String>,
    pub size_bytes: u64,
}

/// Result of removing an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// Statistics from a build cache prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub entries_deleted: u64,
    pub bytes_freed: u64,
}

/// Trait for image build backends.
///
/// Implementations must be safe to share between concurrently running jobs.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Name of this engine.
    fn name(&self) -> &'static str;

    /// Authenticate against a registry.
    async fn login(&self, registry: &Registry) -> Result<()>;

    /// Build an image from a tar context.
    async fn build(&self, request: BuildRequest) -> Result<BuiltImage>;

    /// Push `name:tag` to the registry it was logged into.
    async fn push(&self, name: &str, tag: &str, registry: &Registry) -> Result<()>;

    /// List local images whose reference matches `pattern`.
    ///
    /// The scheduler never calls this; job cleanup removes the exact
    /// references it built. It is kept for tooling that inspects what a
    /// daemon holds, and engines must still answer it.
    async fn list_images(&self, pattern: &str) -> Result<Vec<ImageRef>>;

    /// Remove a local image. A missing image is not an error.
    async fn remove_image(&self, reference: &str) -> Result<RemoveOutcome>;

    /// Drop dangling build cache.
    async fn prune_build_cache(&self) -> Result<PruneStats>;
}

//! Local Docker build engine implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::errors::Error as DockerError;
use bollard::image::{
    BuildImageOptions, ListImagesOptions, PruneBuildOptions, PushImageOptions, RemoveImageOptions,
};
use futures::StreamExt;
use shipyard_core::engine::*;
use shipyard_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Build engine backed by the local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
    /// Credentials recorded by `login`, keyed by registry URI.
    credentials: RwLock<HashMap<String, DockerCredentials>>,
}

impl DockerEngine {
    /// Create a new DockerEngine connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::EngineUnavailable(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            credentials: RwLock::new(HashMap::new()),
        }
    }

    fn credentials_for(registry: &Registry) -> DockerCredentials {
        DockerCredentials {
            username: Some(registry.user.clone()),
            password: Some(registry.password.clone()),
            serveraddress: Some(registry.uri.clone()),
            ..Default::default()
        }
    }

    fn build_options(request: &BuildRequest) -> BuildImageOptions<String> {
        let options = &request.options;
        let mut labels = options.labels.clone();
        labels.extend(request.labels.clone());

        BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.tag.clone(),
            nocache: options.no_cache,
            pull: options.pull,
            rm: true,
            forcerm: true,
            buildargs: options.build_args.clone(),
            labels,
            networkmode: options.network_mode.clone().unwrap_or_default(),
            platform: options.platform.clone().unwrap_or_default(),
            target: options.target.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn engine_error(err: DockerError) -> Error {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => Error::Unauthorized(message),
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(message),
        DockerError::DockerResponseServerError { message, .. } => Error::Internal(message),
        other => Error::EngineUnavailable(other.to_string()),
    }
}

#[async_trait]
impl BuildEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn login(&self, registry: &Registry) -> Result<()> {
        if registry.user.is_empty() {
            return Err(Error::Unauthorized(format!(
                "no user configured for registry {}",
                registry.uri
            )));
        }

        self.docker.ping().await.map_err(engine_error)?;

        // Credentials are sent with every build and push against this registry.
        self.credentials
            .write()
            .await
            .insert(registry.uri.clone(), Self::credentials_for(registry));

        info!(registry = %registry.uri, user = %registry.user, "Registry credentials recorded");
        Ok(())
    }

    async fn build(&self, request: BuildRequest) -> Result<BuiltImage> {
        let options = Self::build_options(&request);
        let credentials = self.credentials.read().await.clone();

        info!(tag = %request.tag, context_bytes = request.context.len(), "Building image");
        let mut stream = self
            .docker
            .build_image(options, Some(credentials), Some(bollard::body_full(request.context)));

        let mut image_id = None;
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::BuildFailed(e.to_string()))?;

            if let Some(error) = info.error {
                return Err(Error::BuildFailed(error));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %request.tag, output = %line, "Build output");
                }
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = Some(id);
            }
        }

        let inspect = self
            .docker
            .inspect_image(&request.tag)
            .await
            .map_err(|e| Error::BuildFailed(format!("built image not found: {}", e)))?;

        let id = image_id.or(inspect.id).unwrap_or_default();
        let size_bytes = inspect
            .size
            .and_then(|size| u64::try_from(size).ok())
            .unwrap_or_default();

        info!(tag = %request.tag, image_id = %id, size_bytes, "Image built");
        Ok(BuiltImage {
            id,
            tag: request.tag,
            size_bytes,
        })
    }

    async fn push(&self, name: &str, tag: &str, registry: &Registry) -> Result<()> {
        let credentials = self
            .credentials
            .read()
            .await
            .get(&registry.uri)
            .cloned()
            .unwrap_or_else(|| Self::credentials_for(registry));

        let options = PushImageOptions {
            tag: tag.to_string(),
        };

        info!(image = %name, tag = %tag, registry = %registry.uri, "Pushing image");
        let mut stream = self
            .docker
            .push_image(name, Some(options), Some(credentials));

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::PushFailed(e.to_string()))?;
            if let Some(error) = info.error {
                return Err(Error::PushFailed(error));
            }
            if let Some(status) = info.status {
                debug!(image = %name, status = %status, "Push progress");
            }
        }

        Ok(())
    }

    async fn list_images(&self, pattern: &str) -> Result<Vec<ImageRef>> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![pattern.to_string()]);

        let options = ListImagesOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(engine_error)?;

        Ok(images
            .into_iter()
            .map(|image| ImageRef {
                id: image.id,
                tags: image.repo_tags,
                size_bytes: u64::try_from(image.size).unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_image(&self, reference: &str) -> Result<RemoveOutcome> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_image(reference, Some(options), None)
            .await
        {
            Ok(deleted) => {
                debug!(image = %reference, layers = deleted.len(), "Image removed");
                Ok(RemoveOutcome::Removed)
            }
            Err(e) if is_not_found(&e) => Ok(RemoveOutcome::NotFound),
            Err(e) => {
                warn!(image = %reference, error = %e, "Image removal failed");
                Err(engine_error(e))
            }
        }
    }

    async fn prune_build_cache(&self) -> Result<PruneStats> {
        let response = self
            .docker
            .prune_build(None::<PruneBuildOptions<String>>)
            .await
            .map_err(engine_error)?;

        Ok(PruneStats {
            entries_deleted: response
                .caches_deleted
                .map(|deleted| deleted.len() as u64)
                .unwrap_or_default(),
            bytes_freed: response
                .space_reclaimed
                .and_then(|bytes| u64::try_from(bytes).ok())
                .unwrap_or_default(),
        })
    }
}

//! Pipeline stages.
//!
//! A job runs its stages in order. Each stage names the status the job moves
//! to while it runs, and does its work against a shared [`StageContext`].

use async_trait::async_trait;
use bytes::Bytes;
use shipyard_core::engine::{BuildEngine, BuildRequest, BuiltImage, Registry};
use shipyard_core::image::{BuildOptions, DOCKERFILE, ImageSpec, JOB_LABEL};
use shipyard_core::{Error, JobId, JobSpec, JobStatus, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Working state shared by the stages of one job.
pub struct StageContext {
    pub job_id: JobId,
    /// Image spec with the job label already inserted.
    pub image: ImageSpec,
    pub registry: Registry,
    pub build_options: BuildOptions,
    /// Tar archive produced by the assemble stage.
    pub build_context: Option<Bytes>,
    /// Image produced by the build stage.
    pub built: Option<BuiltImage>,
    /// Set once the build stage has been entered.
    pub build_started: bool,
    engine: Option<Arc<dyn BuildEngine>>,
}

impl StageContext {
    pub fn new(job_id: JobId, spec: &JobSpec, engine: Arc<dyn BuildEngine>) -> Self {
        Self {
            job_id,
            image: spec.image.with_job_label(job_id),
            registry: spec.registry.clone(),
            build_options: spec.build_options.clone().unwrap_or_default(),
            build_context: None,
            built: None,
            build_started: false,
            engine: Some(engine),
        }
    }

    /// The engine, unless it has already been released.
    pub fn engine(&self) -> Result<&Arc<dyn BuildEngine>> {
        self.engine
            .as_ref()
            .ok_or_else(|| Error::EngineUnavailable(format!("engine released by job {}", self.job_id)))
    }

    /// Drop this job's hold on the engine, handing back the last reference.
    pub fn release_engine(&mut self) -> Option<Arc<dyn BuildEngine>> {
        self.engine.take()
    }

    /// Size of the built image, 0 before the build completes.
    pub fn size(&self) -> u64 {
        self.built.as_ref().map(|b| b.size_bytes).unwrap_or(0)
    }
}

/// One step of the build pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name used in logs and failure messages.
    fn name(&self) -> &'static str;

    /// Status the job holds while this stage runs.
    fn status(&self) -> JobStatus;

    /// Record context written when the stage begins.
    fn describe(&self, ctx: &StageContext) -> String;

    /// Do the stage's work, returning a message on success.
    async fn execute(&self, ctx: &mut StageContext) -> Result<String>;
}

/// The stages every build job runs, in order.
pub fn default_pipeline() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(Authorize),
        Box::new(Assemble),
        Box::new(Build),
        Box::new(Push),
    ]
}

/// Logs into the destination registry.
pub struct Authorize;

#[async_trait]
impl Stage for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    fn status(&self) -> JobStatus {
        JobStatus::Authorizing
    }

    fn describe(&self, ctx: &StageContext) -> String {
        format!("Authorizing against registry {}", ctx.registry.uri)
    }

    async fn execute(&self, ctx: &mut StageContext) -> Result<String> {
        ctx.engine()?.login(&ctx.registry).await?;
        Ok(format!("Logged into {}", ctx.registry.uri))
    }
}

/// Renders the Dockerfile and packs it into a build context.
pub struct Assemble;

#[async_trait]
impl Stage for Assemble {
    fn name(&self) -> &'static str {
        "assemble"
    }

    fn status(&self) -> JobStatus {
        JobStatus::Generating
    }

    fn describe(&self, ctx: &StageContext) -> String {
        format!("Generating build context for {}", ctx.image.full_name())
    }

    async fn execute(&self, ctx: &mut StageContext) -> Result<String> {
        let image = ctx.image.clone();
        let context = tokio::task::spawn_blocking(move || image.to_context())
            .await
            .map_err(|e| Error::Internal(format!("build context task failed: {}", e)))??;

        let message = format!("Build context ready ({} bytes)", context.len());
        ctx.build_context = Some(context);
        Ok(message)
    }
}

/// Builds the image from the assembled context.
pub struct Build;

#[async_trait]
impl Stage for Build {
    fn name(&self) -> &'static str {
        "build"
    }

    fn status(&self) -> JobStatus {
        JobStatus::Building
    }

    fn describe(&self, ctx: &StageContext) -> String {
        format!("Building image {}", ctx.image.full_name())
    }

    async fn execute(&self, ctx: &mut StageContext) -> Result<String> {
        ctx.build_started = true;
        let context = ctx
            .build_context
            .clone()
            .ok_or_else(|| Error::Internal("build context was not assembled".to_string()))?;

        let request = BuildRequest {
            tag: ctx.image.full_name(),
            dockerfile: DOCKERFILE.to_string(),
            context,
            options: ctx.build_options.clone(),
            labels: HashMap::from([(JOB_LABEL.to_string(), ctx.job_id.to_string())]),
        };

        let built = ctx.engine()?.build(request).await?;
        let message = format!("Built image {} ({} bytes)", built.tag, built.size_bytes);
        ctx.built = Some(built);
        Ok(message)
    }
}

/// Pushes the built image to the registry.
pub struct Push;

#[async_trait]
impl Stage for Push {
    fn name(&self) -> &'static str {
        "push"
    }

    fn status(&self) -> JobStatus {
        JobStatus::Pushing
    }

    fn describe(&self, ctx: &StageContext) -> String {
        format!("Pushing {} to {}", ctx.image.full_name(), ctx.registry.uri)
    }

    async fn execute(&self, ctx: &mut StageContext) -> Result<String> {
        ctx.engine()?
            .push(&ctx.image.name, &ctx.image.tag, &ctx.registry)
            .await?;
        Ok("Image successfully pushed".to_string())
    }
}

//! Job status, records and step results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::Registry;
use crate::image::{BuildOptions, ImageSpec};
use crate::{Error, JobId};

/// Lifecycle status of a build job.
///
/// Variants are declared in pipeline order. `Done`, `Failed` and `Cancelled`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Pending,
    Authorizing,
    Generating,
    Building,
    Pushing,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Statuses from which `cancel` is accepted.
    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Pending => "pending",
            JobStatus::Authorizing => "authorizing",
            JobStatus::Generating => "generating",
            JobStatus::Building => "building",
            JobStatus::Pushing => "pushing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "pending" => Ok(JobStatus::Pending),
            "authorizing" => Ok(JobStatus::Authorizing),
            "generating" => Ok(JobStatus::Generating),
            "building" => Ok(JobStatus::Building),
            "pushing" => Ok(JobStatus::Pushing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// What a caller submits to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Image to assemble and build.
    pub image: ImageSpec,
    /// Registry the built image is pushed to.
    pub registry: Registry,
    /// Extra options forwarded to the build.
    #[serde(default)]
    pub build_options: Option<BuildOptions>,
}

/// Persisted state of one job.
///
/// Every status change produces a whole new record which is written to the
/// metadata store before the job moves on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// Full image name (`name:tag`).
    pub target_name: String,
    /// Registry URI the image is pushed to.
    pub target_registry: String,
    /// Repository name of the image.
    pub image: String,
    pub tag: String,
    /// Human-readable description of the current state.
    pub context: String,
    /// Built image size in bytes, 0 until the build completes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId, spec: &JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Created,
            target_name: spec.image.full_name(),
            target_registry: spec.registry.uri.clone(),
            image: spec.image.name.clone(),
            tag: spec.image.tag.clone(),
            context: format!("Job {} created.", id),
            size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive the next record with a new status and context.
    pub fn advance(&self, status: JobStatus, context: impl Into<String>) -> Self {
        Self {
            status,
            context: context.into(),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub message: String,
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

//! A single build job and its lifecycle.
//!
//! A job registers its record, optionally waits for admission, runs its
//! stages under a deadline and finally closes: engine resources are released
//! and exactly one terminal status is persisted.
//!
//! Cancellation is cooperative. A cancelled or timed-out job records
//! CANCELLED right away, but the stage in flight runs to completion and the
//! remaining stages are skipped, so no engine call is abandoned halfway.

use futures::FutureExt;
use shipyard_config::QueueConfig;
use shipyard_core::{
    BuildEngine, Error, JobId, JobRecord, JobSpec, JobStatus, MetadataStore, RemoveOutcome,
    Result, StepResult,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stage::{Stage, StageContext, default_pipeline};

/// Deadlines applied to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimeouts {
    /// Longest wait for admission while pending.
    pub pending: Duration,
    /// Longest pipeline run once admitted.
    pub run: Duration,
}

impl From<&QueueConfig> for JobTimeouts {
    fn from(config: &QueueConfig) -> Self {
        Self {
            pending: config.pending_timeout,
            run: config.run_timeout,
        }
    }
}

/// Why a job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A caller asked for it.
    Requested,
    /// The pending or run deadline passed.
    TimedOut,
    /// The queue is closing.
    Shutdown,
}

impl CancelReason {
    fn context(self, id: JobId) -> String {
        match self {
            CancelReason::Requested => format!("Job {} cancelled", id),
            CancelReason::TimedOut => format!("Job {} timed out", id),
            CancelReason::Shutdown => format!("Job {} cancelled: queue shutting down", id),
        }
    }
}

struct Lifecycle {
    admission: Option<oneshot::Sender<()>>,
    waiter: Option<oneshot::Receiver<()>>,
    error: Option<String>,
    start_time: Instant,
}

/// A build job.
pub struct Job {
    id: JobId,
    record: watch::Sender<JobRecord>,
    store: Arc<dyn MetadataStore>,
    stages: Vec<Box<dyn Stage>>,
    context: tokio::sync::Mutex<StageContext>,
    /// Serializes metadata writes so the store sees records in order.
    persist: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    closed: AtomicBool,
    released: AtomicBool,
    timeouts: JobTimeouts,
}

impl Job {
    pub fn new(
        spec: JobSpec,
        engine: Arc<dyn BuildEngine>,
        store: Arc<dyn MetadataStore>,
        timeouts: JobTimeouts,
    ) -> Self {
        let id = JobId::new();
        let (record, _) = watch::channel(JobRecord::new(id, &spec));
        Self {
            id,
            record,
            store,
            stages: default_pipeline(),
            context: tokio::sync::Mutex::new(StageContext::new(id, &spec, engine)),
            persist: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                admission: None,
                waiter: None,
                error: None,
                start_time: Instant::now(),
            }),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            timeouts,
        }
    }

    /// Tie the job's cancellation to `parent`.
    pub(crate) fn child_of(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Snapshot of the current record.
    pub fn record(&self) -> JobRecord {
        self.record.borrow().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.record.borrow().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// True once [`Job::close`] has released the job's engine resources.
    /// A job only holds its active slot until this point.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Watch record changes as they happen.
    pub fn subscribe(&self) -> watch::Receiver<JobRecord> {
        self.record.subscribe()
    }

    /// The first stage error, if any.
    pub fn error(&self) -> Option<String> {
        self.lifecycle().error.clone()
    }

    /// Time since submission, or since admission for jobs that waited.
    pub fn age(&self) -> Duration {
        self.lifecycle().start_time.elapsed()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold the job in the pending set until [`Job::admit`] is called.
    pub(crate) fn park(&self) {
        let (admission, waiter) = oneshot::channel();
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.admission = Some(admission);
            lifecycle.waiter = Some(waiter);
        }

        let context = format!("Job {} pending", self.id);
        self.record.send_if_modified(|current| {
            if current.status != JobStatus::Created {
                return false;
            }
            *current = current.advance(JobStatus::Pending, context);
            true
        });
    }

    /// Release a parked job. Returns false if it is no longer waiting.
    pub(crate) fn admit(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        let Some(admission) = lifecycle.admission.take() else {
            return false;
        };
        lifecycle.start_time = Instant::now();
        admission.send(()).is_ok()
    }

    fn fail(&self, error: String) {
        self.lifecycle().error.get_or_insert(error);
    }

    /// Run the job to completion and close it.
    pub async fn run(&self) {
        self.execute().await;
        self.close().await;
    }

    async fn execute(&self) {
        if let Err(e) = self.register().await {
            error!(job_id = %self.id, error = %e, "Failed to register job");
            self.fail(format!("failed to register job: {}", e));
            return;
        }

        let waiter = self.lifecycle().waiter.take();
        if let Some(waiter) = waiter {
            debug!(job_id = %self.id, "Job waiting for admission");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                admitted = tokio::time::timeout(self.timeouts.pending, waiter) => match admitted {
                    Ok(Ok(())) => debug!(job_id = %self.id, "Job admitted"),
                    Ok(Err(_)) => {
                        self.cancel_with(CancelReason::Shutdown).await;
                        return;
                    }
                    Err(_) => {
                        warn!(job_id = %self.id, "Job timed out waiting for admission");
                        self.cancel_with(CancelReason::TimedOut).await;
                        return;
                    }
                }
            }
        }

        info!(job_id = %self.id, "Job started");
        let pipeline = self.pipeline();
        tokio::pin!(pipeline);
        let finished = tokio::select! {
            result = pipeline.as_mut() => Some(result),
            _ = tokio::time::sleep(self.timeouts.run) => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                warn!(job_id = %self.id, timeout_secs = self.timeouts.run.as_secs(), "Job timed out");
                // The pipeline keeps being polled so the stage in flight can finish.
                let (result, _) =
                    tokio::join!(pipeline, self.cancel_with(CancelReason::TimedOut));
                result
            }
        };

        match &result.error {
            Some(_) if self.cancel.is_cancelled() => {
                info!(job_id = %self.id, message = %result.message, "Job pipeline stopped")
            }
            Some(e) => error!(job_id = %self.id, message = %result.message, error = %e, "Job failed"),
            None => info!(job_id = %self.id, message = %result.message, "Job pipeline complete"),
        }
    }

    async fn register(&self) -> Result<()> {
        let _guard = self.persist.lock().await;
        let record = self.record();
        self.store.create(&record).await
    }

    async fn pipeline(&self) -> StepResult {
        let mut ctx = self.context.lock().await;
        let mut result = StepResult::ok(format!("Job {} started", self.id));

        for stage in &self.stages {
            if self.cancel.is_cancelled() {
                debug!(job_id = %self.id, stage = stage.name(), "Skipping remaining stages");
                return StepResult::failed(
                    format!("Job {} interrupted", self.id),
                    Error::Cancelled.to_string(),
                );
            }
            result = self.step(stage.as_ref(), &mut ctx).await;
            match &result.error {
                Some(e) => {
                    self.fail(e.clone());
                    break;
                }
                None => debug!(
                    job_id = %self.id,
                    stage = stage.name(),
                    message = %result.message,
                    "Stage complete"
                ),
            }
        }

        result
    }

    async fn step(&self, stage: &dyn Stage, ctx: &mut StageContext) -> StepResult {
        let failed = || format!("{} stage failed", stage.name());

        match self
            .transition(stage.status(), stage.describe(ctx), Some(ctx.size()))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return StepResult::failed(failed(), Error::Cancelled.to_string()),
            Err(e) => return StepResult::failed(failed(), e.to_string()),
        }

        debug!(job_id = %self.id, stage = stage.name(), "Stage started");
        match AssertUnwindSafe(stage.execute(ctx)).catch_unwind().await {
            Ok(Ok(message)) => StepResult::ok(message),
            Ok(Err(e)) => StepResult::failed(failed(), e.to_string()),
            Err(panic) => StepResult::failed(
                failed(),
                format!("{} stage panicked: {}", stage.name(), panic_message(panic.as_ref())),
            ),
        }
    }

    /// Move to a new status unless the record is already terminal, then
    /// persist it. Returns `None` when the record was left unchanged.
    async fn transition(
        &self,
        status: JobStatus,
        context: String,
        size: Option<u64>,
    ) -> Result<Option<JobRecord>> {
        let _guard = self.persist.lock().await;

        let mut next = None;
        self.record.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            let mut record = current.advance(status, context);
            if let Some(size) = size {
                record.size = size;
            }
            *current = record.clone();
            next = Some(record);
            true
        });

        let Some(record) = next else {
            return Ok(None);
        };
        self.store.update(&record).await?;
        Ok(Some(record))
    }

    /// Cancel at the caller's request.
    pub async fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Requested).await
    }

    /// Stop the job and persist CANCELLED. Returns false if the job had
    /// already reached a terminal status.
    pub async fn cancel_with(&self, reason: CancelReason) -> bool {
        self.cancel.cancel();
        match self
            .transition(JobStatus::Cancelled, reason.context(self.id), None)
            .await
        {
            Ok(Some(_)) => {
                info!(job_id = %self.id, reason = ?reason, "Job cancelled");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(job_id = %self.id, error = %e, "Failed to persist cancellation");
                true
            }
        }
    }

    /// Release engine resources and persist the final status. Only the
    /// first call has any effect.
    ///
    /// A job whose token was cancelled without a CANCELLED record (its
    /// queue was dropped) ends CANCELLED rather than DONE.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (engine, build_started, images, size) = {
            let mut ctx = self.context.lock().await;
            if let Some(context) = ctx.build_context.take() {
                debug!(job_id = %self.id, bytes = context.len(), "Released build context");
            }
            let mut images = ctx.image.stage_images();
            images.push(ctx.image.full_name());
            (ctx.release_engine(), ctx.build_started, images, ctx.size())
        };

        if let Some(engine) = engine.filter(|_| build_started) {
            self.clear_images(engine.as_ref(), &images).await;
        }
        self.released.store(true, Ordering::SeqCst);

        let (status, context) = match self.error() {
            Some(e) => (JobStatus::Failed, e),
            None if self.cancel.is_cancelled() => (
                JobStatus::Cancelled,
                CancelReason::Shutdown.context(self.id),
            ),
            None => (JobStatus::Done, format!("Job {} complete", self.id)),
        };
        match self.transition(status, context, Some(size)).await {
            Ok(Some(record)) => info!(job_id = %self.id, status = %record.status, "Job finished"),
            Ok(None) => debug!(job_id = %self.id, status = %self.status(), "Job already final"),
            Err(e) => warn!(job_id = %self.id, error = %e, "Failed to persist final status"),
        }
    }

    async fn clear_images(&self, engine: &dyn BuildEngine, images: &[String]) {
        for image in images {
            match engine.remove_image(image).await {
                Ok(RemoveOutcome::Removed) => debug!(job_id = %self.id, image = %image, "Removed image"),
                Ok(RemoveOutcome::NotFound) => debug!(job_id = %self.id, image = %image, "Image already gone"),
                Err(e) => warn!(job_id = %self.id, image = %image, error = %e, "Failed to remove image"),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

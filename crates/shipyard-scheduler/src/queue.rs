//! Bounded job queue with periodic reconciliation.
//!
//! Submitted jobs go straight into an active slot when one is free and no
//! job is already waiting; otherwise they are parked in the pending set.
//! The reconciliation loop prunes the build cache, forgets terminal jobs
//! past their retention window, sweeps finished ids out of both sets and
//! promotes pending jobs first-in first-out. An active job keeps its slot
//! until its engine resources have been released, even after its record
//! turned terminal.

use futures::future::join_all;
use serde::Serialize;
use shipyard_config::QueueConfig;
use shipyard_core::{BuildEngine, JobId, JobRecord, JobSpec, MetadataStore, RemoveOutcome};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::{CancelReason, Job, JobTimeouts};

/// Shortest period the reconciliation loop will tick at.
const MIN_RECONCILE_INTERVAL: Duration = Duration::from_millis(1);

/// Errors returned to queue callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue full: {current} of {limit} pending slots in use")]
    QueueFull { limit: usize, current: usize },

    #[error("job {id} not found or already finished")]
    NotFound { id: JobId },

    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Occupancy of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub active: usize,
    pub pending: usize,
    /// Every job still tracked, including finished ones awaiting pruning.
    pub total: usize,
    pub max_active: usize,
    pub max_pending: usize,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub pruned: usize,
    pub promoted: usize,
}

struct JobEntry {
    job: Arc<Job>,
    task: Option<JoinHandle<()>>,
}

struct QueueState {
    jobs: HashMap<JobId, JobEntry>,
    active: VecDeque<JobId>,
    pending: VecDeque<JobId>,
    engine: Option<Arc<dyn BuildEngine>>,
    closed: bool,
}

impl QueueState {
    fn forget(&mut self, id: JobId) -> Option<Arc<Job>> {
        self.active.retain(|other| *other != id);
        self.pending.retain(|other| *other != id);
        self.jobs.remove(&id).map(|entry| entry.job)
    }
}

struct Shared {
    config: QueueConfig,
    store: Arc<dyn MetadataStore>,
    state: Mutex<QueueState>,
}

/// Admits, tracks and reconciles build jobs.
///
/// Call [`JobQueue::close`] to shut down with CANCELLED records and engine
/// cleanup awaited. Dropping the queue instead stops the reconciliation loop
/// and signals every job to stop; their tasks still finish the stage in
/// flight and release their resources in the background.
pub struct JobQueue {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    /// Parent of every job's cancellation token.
    abort: CancellationToken,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Create a queue without a reconciliation loop; call
    /// [`JobQueue::reconcile`] to drive it.
    pub fn new(
        engine: Arc<dyn BuildEngine>,
        store: Arc<dyn MetadataStore>,
        config: QueueConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            store,
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                active: VecDeque::new(),
                pending: VecDeque::new(),
                engine: Some(engine),
                closed: false,
            }),
        });

        Self {
            shared,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            reconciler: Mutex::new(None),
        }
    }

    /// Create a queue and start its reconciliation loop.
    pub fn start(
        engine: Arc<dyn BuildEngine>,
        store: Arc<dyn MetadataStore>,
        config: QueueConfig,
    ) -> Self {
        let mut queue = Self::new(engine, store, config);
        let handle = tokio::spawn(reconcile_loop(queue.shared.clone(), queue.shutdown.clone()));
        queue.reconciler = Mutex::new(Some(handle));
        queue
    }

    /// Accept a job, running it now or parking it until a slot frees up.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobRecord, QueueError> {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(QueueError::ShuttingDown);
        }
        let Some(engine) = state.engine.clone() else {
            return Err(QueueError::ShuttingDown);
        };

        let admit_now = state.active.len() < config.max_active && state.pending.is_empty();
        if !admit_now && state.pending.len() >= config.max_pending {
            return Err(QueueError::QueueFull {
                limit: config.max_pending,
                current: state.pending.len(),
            });
        }

        let job = Arc::new(
            Job::new(
                spec,
                engine,
                self.shared.store.clone(),
                JobTimeouts::from(config),
            )
            .child_of(&self.abort),
        );
        if !admit_now {
            job.park();
        }

        let id = job.id();
        let record = job.record();
        let task = tokio::spawn({
            let job = job.clone();
            async move { job.run().await }
        });
        state.jobs.insert(
            id,
            JobEntry {
                job,
                task: Some(task),
            },
        );

        if admit_now {
            state.active.push_back(id);
        } else {
            state.pending.push_back(id);
        }
        info!(
            job_id = %id,
            image = %record.target_name,
            status = %record.status,
            active = state.active.len(),
            pending = state.pending.len(),
            "Job submitted"
        );

        Ok(record)
    }

    /// Current record of a tracked job.
    pub async fn get(&self, id: JobId) -> Result<JobRecord, QueueError> {
        self.job(id).await.map(|job| job.record())
    }

    /// Wait until a tracked job reaches a terminal status.
    pub async fn wait(&self, id: JobId) -> Result<JobRecord, QueueError> {
        let mut updates = self.job(id).await?.subscribe();
        let record = updates
            .wait_for(|record| record.is_terminal())
            .await
            .map_err(|_| QueueError::NotFound { id })?
            .clone();
        Ok(record)
    }

    /// Cancel a job that has not finished yet.
    pub async fn cancel(&self, id: JobId) -> Result<JobRecord, QueueError> {
        let job = self.job(id).await?;
        if !job.status().is_cancellable() || !job.cancel().await {
            return Err(QueueError::NotFound { id });
        }
        Ok(job.record())
    }

    /// Records of every tracked job, oldest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let state = self.shared.state.lock().await;
        let mut records: Vec<JobRecord> = state.jobs.values().map(|e| e.job.record()).collect();
        records.sort_by_key(|record| (record.created_at, record.id));
        records
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock().await;
        QueueStats {
            active: state.active.len(),
            pending: state.pending.len(),
            total: state.jobs.len(),
            max_active: self.shared.config.max_active,
            max_pending: self.shared.config.max_pending,
        }
    }

    /// Run one reconciliation pass.
    pub async fn reconcile(&self) -> ReconcileStats {
        self.shared.reconcile().await
    }

    /// Stop the reconciliation loop, cancel and close every job that is
    /// still running, then release the engine.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.reconciler.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconciliation loop ended abnormally");
            }
        }

        let entries: Vec<(Arc<Job>, Option<JoinHandle<()>>)> = {
            let mut state = self.shared.state.lock().await;
            state.closed = true;
            state.active.clear();
            state.pending.clear();
            state
                .jobs
                .values_mut()
                .map(|entry| (entry.job.clone(), entry.task.take()))
                .collect()
        };
        info!(jobs = entries.len(), "Closing job queue");

        join_all(entries.into_iter().map(|(job, task)| async move {
            if !job.is_terminal() {
                job.cancel_with(CancelReason::Shutdown).await;
            }
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(job_id = %job.id(), error = %e, "Job task ended abnormally");
                }
            }
            job.close().await;
        }))
        .await;

        self.shared.state.lock().await.engine.take();
        info!("Job queue closed");
    }

    async fn job(&self, id: JobId) -> Result<Arc<Job>, QueueError> {
        let state = self.shared.state.lock().await;
        state
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(QueueError::NotFound { id })
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.abort.cancel();
    }
}

async fn reconcile_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut period = shared.config.reconcile_interval;
    if period.is_zero() {
        warn!(
            interval_ms = MIN_RECONCILE_INTERVAL.as_millis() as u64,
            "Reconcile interval is zero, using the minimum"
        );
        period = MIN_RECONCILE_INTERVAL;
    }
    info!(interval_ms = period.as_millis() as u64, "Reconciliation loop started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                shared.reconcile().await;
            }
        }
    }

    info!("Reconciliation loop stopped");
}

impl Shared {
    async fn reconcile(&self) -> ReconcileStats {
        let Some(engine) = self.state.lock().await.engine.clone() else {
            return ReconcileStats::default();
        };

        match engine.prune_build_cache().await {
            Ok(stats) => debug!(
                entries = stats.entries_deleted,
                bytes = stats.bytes_freed,
                "Pruned build cache"
            ),
            Err(e) => warn!(error = %e, "Failed to prune build cache"),
        }

        let expired: Vec<Arc<Job>> = {
            let mut state = self.state.lock().await;
            let ids: Vec<JobId> = state
                .jobs
                .iter()
                .filter(|(_, entry)| {
                    entry.job.is_terminal()
                        && entry.job.is_released()
                        && entry.job.age() > self.config.retention
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| state.forget(id)).collect()
        };

        for job in &expired {
            let image = job.record().target_name;
            match engine.remove_image(&image).await {
                Ok(RemoveOutcome::Removed) => debug!(job_id = %job.id(), image = %image, "Removed image"),
                Ok(RemoveOutcome::NotFound) => debug!(job_id = %job.id(), image = %image, "Image already gone"),
                Err(e) => warn!(job_id = %job.id(), image = %image, error = %e, "Failed to remove image"),
            }
            info!(job_id = %job.id(), status = %job.status(), "Pruned job");
        }

        let mut state = self.state.lock().await;
        let QueueState {
            jobs,
            active,
            pending,
            ..
        } = &mut *state;
        active.retain(|id| jobs.get(id).is_some_and(|entry| !entry.job.is_released()));
        pending.retain(|id| jobs.get(id).is_some_and(|entry| !entry.job.is_terminal()));

        let mut promoted = 0;
        while active.len() < self.config.max_active {
            let Some(id) = pending.pop_front() else {
                break;
            };
            match jobs.get(&id) {
                Some(entry) if entry.job.admit() => {
                    active.push_back(id);
                    promoted += 1;
                    info!(job_id = %id, "Job promoted to active");
                }
                _ => debug!(job_id = %id, "Pending job no longer waiting"),
            }
        }

        ReconcileStats {
            pruned: expired.len(),
            promoted,
        }
    }
}

//! Test doubles shared by the scheduler tests.

use async_trait::async_trait;
use shipyard_core::engine::*;
use shipyard_core::{
    Error, ImageSpec, JobId, JobRecord, JobSpec, JobStatus, Layer, MetadataStore, Result,
};
use shipyard_db::MemoryJobStore;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Login(String),
    Build(String),
    Push(String),
    ListImages(String),
    Remove(String),
    Prune,
}

/// In-memory engine that records every call.
#[derive(Default)]
pub struct MockEngine {
    calls: Mutex<Vec<EngineCall>>,
    images: Mutex<HashSet<String>>,
    build_error: Option<String>,
    build_delay: Option<Duration>,
    remove_delay: Option<Duration>,
    panic_on_build: bool,
    fail_cleanup: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts a job-side engine call for as long as it is alive.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockEngine {
    pub const IMAGE_SIZE: u64 = 42_000_000;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build_error(mut self, error: &str) -> Self {
        self.build_error = Some(error.to_string());
        self
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = Some(delay);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_build = true;
        self
    }

    pub fn with_failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn removals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Remove(reference) => Some(reference),
                _ => None,
            })
            .collect()
    }

    /// Most login, build, push and remove calls ever running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }
}

#[async_trait]
impl BuildEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn login(&self, registry: &Registry) -> Result<()> {
        let _call = self.enter();
        self.record(EngineCall::Login(registry.uri.clone()));
        Ok(())
    }

    async fn build(&self, request: BuildRequest) -> Result<BuiltImage> {
        let _call = self.enter();
        self.record(EngineCall::Build(request.tag.clone()));
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_build {
            panic!("builder crashed");
        }
        if let Some(error) = &self.build_error {
            return Err(Error::BuildFailed(error.clone()));
        }
        self.images.lock().unwrap().insert(request.tag.clone());
        Ok(BuiltImage {
            id: format!("sha256:{}", request.tag.len()),
            tag: request.tag,
            size_bytes: Self::IMAGE_SIZE,
        })
    }

    async fn push(&self, name: &str, tag: &str, _registry: &Registry) -> Result<()> {
        let _call = self.enter();
        self.record(EngineCall::Push(format!("{}:{}", name, tag)));
        Ok(())
    }

    async fn list_images(&self, pattern: &str) -> Result<Vec<ImageRef>> {
        self.record(EngineCall::ListImages(pattern.to_string()));
        Ok(vec![])
    }

    async fn remove_image(&self, reference: &str) -> Result<RemoveOutcome> {
        let _call = self.enter();
        self.record(EngineCall::Remove(reference.to_string()));
        if let Some(delay) = self.remove_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_cleanup {
            return Err(Error::EngineUnavailable("daemon gone".to_string()));
        }
        if self.images.lock().unwrap().remove(reference) {
            Ok(RemoveOutcome::Removed)
        } else {
            Ok(RemoveOutcome::NotFound)
        }
    }

    async fn prune_build_cache(&self) -> Result<PruneStats> {
        self.record(EngineCall::Prune);
        if self.fail_cleanup {
            return Err(Error::EngineUnavailable("daemon gone".to_string()));
        }
        Ok(PruneStats::default())
    }
}

/// Store whose writes always fail.
pub struct FailingStore;

#[async_trait]
impl MetadataStore for FailingStore {
    async fn create(&self, _record: &JobRecord) -> Result<()> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn update(&self, _record: &JobRecord) -> Result<()> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn get(&self, _id: JobId) -> Result<Option<JobRecord>> {
        Ok(None)
    }
}

/// Store that accepts every write except updates to `status`.
pub struct StatusFailingStore {
    status: JobStatus,
    inner: MemoryJobStore,
}

impl StatusFailingStore {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            inner: MemoryJobStore::new(),
        }
    }

    pub async fn statuses(&self, id: JobId) -> Vec<JobStatus> {
        self.inner.history(id).await.into_iter().map(|r| r.status).collect()
    }
}

#[async_trait]
impl MetadataStore for StatusFailingStore {
    async fn create(&self, record: &JobRecord) -> Result<()> {
        self.inner.create(record).await
    }

    async fn update(&self, record: &JobRecord) -> Result<()> {
        if record.status == self.status {
            return Err(Error::Store("deadlock detected".to_string()));
        }
        self.inner.update(record).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.inner.get(id).await
    }
}

pub fn make_spec(name: &str, tag: &str) -> JobSpec {
    JobSpec {
        image: ImageSpec {
            name: name.to_string(),
            tag: tag.to_string(),
            layers: vec![
                Layer::Stage {
                    base: "alpine".to_string(),
                    tag: "3.19".to_string(),
                    alias: None,
                },
                Layer::Run {
                    command: "apk add --no-cache curl".to_string(),
                },
            ],
        },
        registry: Registry {
            uri: "registry.local".to_string(),
            user: "ci".to_string(),
            password: "secret".to_string(),
        },
        build_options: None,
    }
}

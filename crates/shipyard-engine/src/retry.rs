//! Retry wrapper around a build engine.
//!
//! Registry login, push, image listing and cache pruning are retried with
//! exponential backoff when they fail with a transient error. Builds and image
//! removal pass straight through.

use async_trait::async_trait;
use shipyard_core::engine::*;
use shipyard_core::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(retry))
    }

    async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Engine call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A build engine that retries transient failures of another engine.
pub struct RetryEngine {
    inner: Arc<dyn BuildEngine>,
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(inner: Arc<dyn BuildEngine>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl BuildEngine for RetryEngine {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn login(&self, registry: &Registry) -> Result<()> {
        self.policy
            .run("login", || self.inner.login(registry))
            .await
    }

    async fn build(&self, request: BuildRequest) -> Result<BuiltImage> {
        self.inner.build(request).await
    }

    async fn push(&self, name: &str, tag: &str, registry: &Registry) -> Result<()> {
        self.policy
            .run("push", || self.inner.push(name, tag, registry))
            .await
    }

    async fn list_images(&self, pattern: &str) -> Result<Vec<ImageRef>> {
        self.policy
            .run("list_images", || self.inner.list_images(pattern))
            .await
    }

    async fn remove_image(&self, reference: &str) -> Result<RemoveOutcome> {
        self.inner.remove_image(reference).await
    }

    async fn prune_build_cache(&self) -> Result<PruneStats> {
        self.policy
            .run("prune_build_cache", || self.inner.prune_build_cache())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` pushes and listings with the given error.
    struct FlakyEngine {
        failures: u32,
        transient: bool,
        pushes: AtomicU32,
        builds: AtomicU32,
        lists: AtomicU32,
    }

    impl FlakyEngine {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                failures,
                transient,
                pushes: AtomicU32::new(0),
                builds: AtomicU32::new(0),
                lists: AtomicU32::new(0),
            }
        }

        fn failure(&self) -> Error {
            if self.transient {
                Error::PushFailed("connection reset".to_string())
            } else {
                Error::Unauthorized("denied".to_string())
            }
        }
    }

    #[async_trait]
    impl BuildEngine for FlakyEngine {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn login(&self, _registry: &Registry) -> Result<()> {
            Ok(())
        }

        async fn build(&self, _request: BuildRequest) -> Result<BuiltImage> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Err(Error::BuildFailed("step 3 failed".to_string()))
        }

        async fn push(&self, _name: &str, _tag: &str, _registry: &Registry) -> Result<()> {
            let attempt = self.pushes.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(self.failure())
            } else {
                Ok(())
            }
        }

        async fn list_images(&self, pattern: &str) -> Result<Vec<ImageRef>> {
            let attempt = self.lists.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(self.failure());
            }
            Ok(vec![ImageRef {
                id: "sha256:abc".to_string(),
                tags: vec![format!("{}:v1", pattern)],
                size_bytes: 1024,
            }])
        }

        async fn remove_image(&self, _reference: &str) -> Result<RemoveOutcome> {
            Ok(RemoveOutcome::NotFound)
        }

        async fn prune_build_cache(&self) -> Result<PruneStats> {
            Ok(PruneStats::default())
        }
    }

    fn make_registry() -> Registry {
        Registry {
            uri: "registry.local".to_string(),
            user: "ci".to_string(),
            password: "secret".to_string(),
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = policy(5);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let inner = Arc::new(FlakyEngine::new(2, true));
        let engine = RetryEngine::new(inner.clone(), policy(3));

        let result = engine.push("app", "v1", &make_registry()).await;

        assert!(result.is_ok());
        assert_eq!(inner.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let inner = Arc::new(FlakyEngine::new(10, true));
        let engine = RetryEngine::new(inner.clone(), policy(3));

        let result = engine.push("app", "v1", &make_registry()).await;

        assert!(matches!(result, Err(Error::PushFailed(_))));
        assert_eq!(inner.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failures_are_not_retried() {
        let inner = Arc::new(FlakyEngine::new(10, false));
        let engine = RetryEngine::new(inner.clone(), policy(3));

        let result = engine.push("app", "v1", &make_registry()).await;

        assert!(matches!(result, Err(Error::Unauthorized(_))));
        assert_eq!(inner.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_listing_is_retried() {
        let inner = Arc::new(FlakyEngine::new(1, true));
        let engine = RetryEngine::new(inner.clone(), policy(3));

        let images = engine.list_images("app").await.unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].tags, vec!["app:v1".to_string()]);
        assert_eq!(inner.lists.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_builds_are_not_retried() {
        let inner = Arc::new(FlakyEngine::new(0, true));
        let engine = RetryEngine::new(inner.clone(), policy(3));

        let result = engine
            .build(BuildRequest {
                tag: "app:v1".to_string(),
                dockerfile: "Dockerfile".to_string(),
                context: bytes::Bytes::new(),
                options: Default::default(),
                labels: Default::default(),
            })
            .await;

        assert!(matches!(result, Err(Error::BuildFailed(_))));
        assert_eq!(inner.builds.load(Ordering::SeqCst), 1);
        assert_eq!(engine.name(), "flaky");
    }
}

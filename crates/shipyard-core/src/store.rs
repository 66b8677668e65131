//! Metadata store abstraction for job records.

use async_trait::async_trait;

use crate::{JobId, JobRecord, Result};

/// Trait for job record persistence backends.
///
/// Writes are keyed by `JobRecord::id` and must be idempotent under retry.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record.
    async fn create(&self, record: &JobRecord) -> Result<()>;

    /// Replace the record with the same id.
    async fn update(&self, record: &JobRecord) -> Result<()>;

    /// Fetch a record by id.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;
}

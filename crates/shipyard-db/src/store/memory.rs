//! In-process metadata store.

use async_trait::async_trait;
use shipyard_core::{Error, JobId, JobRecord, MetadataStore, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps job records in memory, along with every write made to them.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<JobId, JobRecord>,
    writes: Vec<JobRecord>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record written for `id`, oldest first.
    pub async fn history(&self, id: JobId) -> Vec<JobRecord> {
        self.inner
            .read()
            .await
            .writes
            .iter()
            .filter(|record| record.id == id)
            .cloned()
            .collect()
    }

    /// All current records ordered by id.
    pub async fn records(&self) -> Vec<JobRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<JobRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }
}

#[async_trait]
impl MetadataStore for MemoryJobStore {
    async fn create(&self, record: &JobRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .records
            .entry(record.id)
            .or_insert_with(|| record.clone());
        inner.writes.push(record.clone());
        Ok(())
    }

    async fn update(&self, record: &JobRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.records.get_mut(&record.id) {
            Some(existing) => *existing = record.clone(),
            None => return Err(Error::NotFound(format!("job record {}", record.id))),
        }
        inner.writes.push(record.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }
}

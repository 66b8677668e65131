//! PostgreSQL metadata store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::{JobId, JobRecord, MetadataStore};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A job record row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    status: String,
    target_name: String,
    target_registry: String,
    image: String,
    tag: String,
    context: String,
    size: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e: shipyard_core::Error| DbError::Corrupt(e.to_string()))?;
        Ok(JobRecord {
            id: JobId::from(row.id),
            status,
            target_name: row.target_name,
            target_registry: row.target_registry,
            image: row.image,
            tag: row.tag,
            context: row.context,
            size: u64::try_from(row.size).unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn size_column(record: &JobRecord) -> i64 {
    i64::try_from(record.size).unwrap_or(i64::MAX)
}

/// PostgreSQL implementation of MetadataStore.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, record: &JobRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_records
                (id, status, target_name, target_registry, image, tag, context, size, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(&record.target_name)
        .bind(&record.target_registry)
        .bind(&record.image)
        .bind(&record.tag)
        .bind(&record.context)
        .bind(size_column(record))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace(&self, record: &JobRecord) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = $2, context = $3, size = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(&record.context)
        .bind(size_column(record))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job record {}", record.id)));
        }
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> DbResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM job_records WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }
}

#[async_trait]
impl MetadataStore for PgJobStore {
    async fn create(&self, record: &JobRecord) -> shipyard_core::Result<()> {
        Ok(self.insert(record).await?)
    }

    async fn update(&self, record: &JobRecord) -> shipyard_core::Result<()> {
        Ok(self.replace(record).await?)
    }

    async fn get(&self, id: JobId) -> shipyard_core::Result<Option<JobRecord>> {
        Ok(self.fetch(id).await?)
    }
}

/// Integration tests that require PostgreSQL.
/// Run with: DATABASE_URL=... cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use shipyard_core::{ImageSpec, JobSpec, JobStatus, Layer, Registry};

    fn make_record() -> JobRecord {
        let spec = JobSpec {
            image: ImageSpec {
                name: "app".to_string(),
                tag: "v1".to_string(),
                layers: vec![Layer::Stage {
                    base: "alpine".to_string(),
                    tag: "3.19".to_string(),
                    alias: None,
                }],
            },
            registry: Registry {
                uri: "registry.local".to_string(),
                user: "ci".to_string(),
                password: "secret".to_string(),
            },
            build_options: None,
        };
        JobRecord::new(JobId::new(), &spec)
    }

    async fn make_store() -> PgJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url).await.expect("Should connect to Postgres");
        run_migrations(&pool).await.expect("Should run migrations");
        PgJobStore::new(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn test_record_lifecycle() {
        let store = make_store().await;
        let record = make_record();

        store.create(&record).await.unwrap();
        let mut done = record.advance(JobStatus::Done, "complete");
        done.size = 42_000_000;
        store.update(&done).await.unwrap();

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.size, 42_000_000);
        assert_eq!(stored.target_name, "app:v1");
    }

    #[tokio::test]
    #[ignore]
    async fn test_update_missing_record() {
        let store = make_store().await;
        let result = store.update(&make_record()).await;
        assert!(matches!(result, Err(shipyard_core::Error::NotFound(_))));
    }
}

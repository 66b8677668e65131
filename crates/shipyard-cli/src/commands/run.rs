//! Local batch build command.

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use shipyard_config::{StoreConfig, SystemConfig, parse_duration};
use shipyard_core::{BuildEngine, JobId, JobRecord, JobStatus, MetadataStore};
use shipyard_db::{MemoryJobStore, PgJobStore, create_pool, run_migrations};
use shipyard_engine::{DockerEngine, RetryEngine, RetryPolicy};
use shipyard_scheduler::JobQueue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::load_job;

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub database_url: Option<String>,
    pub wait: Option<String>,
    pub json: bool,
    pub jobs: Vec<PathBuf>,
}

/// Build every job file through a local queue and report the outcomes.
pub async fn run(options: RunOptions) -> Result<()> {
    let config = match &options.config {
        Some(path) => SystemConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => SystemConfig::default(),
    };
    let wait = options
        .wait
        .as_deref()
        .map(parse_duration)
        .transpose()
        .context("Invalid --wait duration")?;

    let jobs = options
        .jobs
        .iter()
        .map(|path| load_job(path).map(|spec| (path, spec)))
        .collect::<Result<Vec<_>>>()?;

    let docker = DockerEngine::new().context("Failed to connect to Docker")?;
    let engine: Arc<dyn BuildEngine> = Arc::new(RetryEngine::new(
        Arc::new(docker),
        RetryPolicy {
            attempts: config.retry.attempts,
            backoff: config.retry.backoff,
        },
    ));
    let store = open_store(&config.store, options.database_url.as_deref()).await?;
    let queue = JobQueue::start(engine, store.clone(), config.queue.clone());

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for (path, spec) in jobs {
        match queue.submit(spec).await {
            Ok(record) => {
                println!("{} {} {} ({})", record.id, record.status, record.target_name, path.display());
                accepted.push(record.id);
            }
            Err(e) => {
                println!("rejected {}: {}", path.display(), e);
                rejected += 1;
            }
        }
    }

    let finished = wait_for_jobs(&queue, &accepted, wait).await;
    queue.close().await;

    let records = final_records(&queue, store.as_ref(), &accepted, finished).await;
    report(&records, options.json)?;

    let done = records.iter().filter(|r| r.status == JobStatus::Done).count();
    let failed = accepted.len() - done;
    if failed > 0 || rejected > 0 {
        anyhow::bail!(
            "{} of {} jobs did not complete",
            failed + rejected,
            accepted.len() + rejected
        );
    }
    Ok(())
}

/// Collect terminal records as jobs finish, until every job is done, `limit`
/// passes or the process is interrupted.
async fn wait_for_jobs(
    queue: &JobQueue,
    ids: &[JobId],
    limit: Option<Duration>,
) -> HashMap<JobId, JobRecord> {
    let mut finished = HashMap::with_capacity(ids.len());
    let mut outstanding: FuturesUnordered<_> = ids
        .iter()
        .map(|id| async move { (*id, queue.wait(*id).await) })
        .collect();

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            next = outstanding.next() => match next {
                Some((id, Ok(record))) => {
                    finished.insert(id, record);
                }
                Some((id, Err(e))) => warn!(job_id = %id, error = %e, "Lost track of job"),
                None => break,
            },
            _ = &mut deadline => {
                warn!(remaining = outstanding.len(), "Stopped waiting for jobs");
                break;
            }
            _ = &mut interrupted => {
                warn!("Interrupted, cancelling outstanding jobs");
                break;
            }
        }
    }

    finished
}

/// Final record of every accepted job. Records the queue no longer tracks
/// are read back from the store.
async fn final_records(
    queue: &JobQueue,
    store: &dyn MetadataStore,
    ids: &[JobId],
    mut finished: HashMap<JobId, JobRecord>,
) -> Vec<JobRecord> {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let record = match finished.remove(id) {
            Some(record) => Some(record),
            None => match queue.get(*id).await {
                Ok(record) => Some(record),
                Err(_) => store.get(*id).await.unwrap_or_else(|e| {
                    warn!(job_id = %id, error = %e, "Failed to read job record");
                    None
                }),
            },
        };
        match record {
            Some(record) => records.push(record),
            None => warn!(job_id = %id, "No record left for job"),
        }
    }
    records
}

async fn open_store(config: &StoreConfig, database_url: Option<&str>) -> Result<Arc<dyn MetadataStore>> {
    let url = match (database_url, config) {
        (Some(url), _) => url,
        (None, StoreConfig::Postgres { url }) => url.as_str(),
        (None, StoreConfig::Memory) => {
            info!("Keeping job records in memory");
            return Ok(Arc::new(MemoryJobStore::new()));
        }
    };

    let pool = create_pool(url)
        .await
        .context("Failed to connect to the database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Keeping job records in Postgres");
    Ok(Arc::new(PgJobStore::new(pool)))
}

fn report(records: &[JobRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    println!("\n--- Job Summary ---");
    for record in records {
        let marker = match record.status {
            JobStatus::Done => "✓",
            JobStatus::Cancelled => "⊘",
            _ => "✗",
        };
        println!(
            "  {} {} {} - {} ({} bytes)",
            marker, record.id, record.target_name, record.context, record.size
        );
    }
    Ok(())
}

//! Durable job records.
//!
//! The job table never awaits the database. It hands each persisted
//! snapshot to a [`PersistHandle`]; a single writer task saves them in
//! emission order, so the stored row always converges on the latest state.

use async_trait::async_trait;
use kiln_core::error::CoreError;
use kiln_core::job::Job;
use kiln_core::types::{JobId, Timestamp};
use kiln_db::repositories::GenerationJobRepo;
use kiln_db::DbPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored job is corrupt: {0}")]
    Corrupt(#[from] CoreError),
}

/// Where job records outlive the in-memory table.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Delete terminal records completed before `cutoff`.
    async fn purge_before(&self, cutoff: Timestamp) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        GenerationJobRepo::upsert(&self.pool, job).await?;
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = GenerationJobRepo::find_by_id(&self.pool, id.as_str()).await?;
        Ok(row.map(|row| row.into_job()).transpose()?)
    }

    async fn purge_before(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        Ok(GenerationJobRepo::purge_completed_before(&self.pool, cutoff).await?)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Non-blocking handle to the persistence writer.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl PersistHandle {
    /// Spawn the writer on `tasks`. After `cancel` fires it saves whatever
    /// was already queued, then exits.
    pub fn spawn(store: Arc<dyn JobStore>, tasks: &TaskTracker, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tasks.spawn(run_writer(store, rx, cancel));
        Self { tx }
    }

    pub fn save(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!("Persistence writer stopped, job snapshot not saved");
        }
    }
}

async fn run_writer(
    store: Arc<dyn JobStore>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            job = rx.recv() => match job {
                Some(job) => write(store.as_ref(), &job).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                let mut flushed = 0usize;
                while let Ok(job) = rx.try_recv() {
                    write(store.as_ref(), &job).await;
                    flushed += 1;
                }
                tracing::debug!(flushed, "Flushed pending job snapshots");
                break;
            }
        }
    }
    tracing::info!("Persistence writer stopped");
}

async fn write(store: &dyn JobStore, job: &Job) {
    if let Err(e) = store.save(job).await {
        tracing::error!(job_id = %job.id, state = job.state.as_str(), error = %e, "Failed to persist job");
    }
}

//! Fixed-size worker pool.
//!
//! Each worker pulls the next job from the table's FIFO queue and drives it
//! to a terminal state before pulling again, which bounds concurrent
//! submissions to the render engine at `worker_count`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::orchestrator::Orchestrator;
use crate::table::JobTable;

pub struct WorkerPool {
    tasks: TaskTracker,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawn `worker_count` workers. They stop taking new jobs once
    /// `shutdown` fires or the table is closed; a job already leased is
    /// still driven to a terminal state.
    pub fn spawn(
        worker_count: usize,
        table: Arc<JobTable>,
        orchestrator: Arc<Orchestrator>,
        shutdown: CancellationToken,
    ) -> Self {
        let tasks = TaskTracker::new();

        for worker_id in 0..worker_count {
            let table = Arc::clone(&table);
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown = shutdown.clone();

            tasks.spawn(async move {
                tracing::debug!(worker_id, "Worker started");
                while let Some(lease) = table.next_lease(&shutdown).await {
                    tracing::debug!(worker_id, job_id = %lease.id(), "Worker picked up job");
                    orchestrator.drive(lease).await;
                }
                tracing::debug!(worker_id, "Worker stopped");
            });
        }
        tasks.close();

        tracing::info!(worker_count, "Worker pool started");
        Self {
            tasks,
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Wait for every worker to exit.
    pub async fn join(&self) {
        self.tasks.wait().await;
    }
}

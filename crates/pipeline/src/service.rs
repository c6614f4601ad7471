//! Caller-facing surface of the pipeline.
//!
//! [`GenerationService`] owns every background task: the worker pool, the
//! progress broadcaster, the persistence writer, the system-status
//! reporter, the retention janitor and quality-gate runs. All of them stop
//! through [`GenerationService::shutdown`].

use std::sync::Arc;

use kiln_comfyui::RenderGateway;
use kiln_core::classifier::ErrorClassifier;
use kiln_core::error::CoreError;
use kiln_core::job::Job;
use kiln_core::job_events::{ProgressEvent, SystemStatus};
use kiln_core::params::{validate_params, GenerationParams};
use kiln_core::types::JobId;
use kiln_events::{ProgressBroadcaster, Subscription};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PipelineConfig;
use crate::orchestrator::{AttemptTiming, Orchestrator};
use crate::pool::WorkerPool;
use crate::quality::{ArtifactQualityGate, QualityGate, QualityRunner};
use crate::store::{JobStore, PersistHandle};
use crate::table::JobTable;
use crate::{janitor, status};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct GenerationServiceBuilder {
    config: PipelineConfig,
    gateway: Arc<dyn RenderGateway>,
    quality_gate: Option<Arc<dyn QualityGate>>,
    store: Option<Arc<dyn JobStore>>,
    classifier: ErrorClassifier,
}

impl GenerationServiceBuilder {
    /// Use a custom quality gate instead of [`ArtifactQualityGate`] rooted
    /// at `config.artifact_root`.
    pub fn quality_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.quality_gate = Some(gate);
        self
    }

    /// Write every state transition through to `store`, and fall back to it
    /// for jobs no longer held in memory.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Spawn every background task and start accepting jobs.
    ///
    /// Must be called from within a Tokio runtime. The configuration is
    /// used as given; [`PipelineConfig::from_env`] is where it is validated.
    pub fn start(self) -> Arc<GenerationService> {
        let Self {
            config,
            gateway,
            quality_gate,
            store,
            classifier,
        } = self;

        // Broadcaster and writer outlive the workers so the final events
        // of drained jobs are still delivered and saved.
        let event_tasks = TaskTracker::new();
        let event_cancel = CancellationToken::new();
        let broadcaster =
            ProgressBroadcaster::spawn(config.observer_buffer, &event_tasks, event_cancel.clone());
        let persist = store
            .as_ref()
            .map(|store| PersistHandle::spawn(Arc::clone(store), &event_tasks, event_cancel.clone()));

        let table = Arc::new(JobTable::new(broadcaster.clone(), persist));

        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let gate = quality_gate
            .unwrap_or_else(|| Arc::new(ArtifactQualityGate::new(config.artifact_root.clone())));
        let quality = QualityRunner::new(gate, config.quality.clone(), Arc::clone(&table), tasks.clone());

        let orchestrator = Arc::new(Orchestrator::new(
            gateway,
            Arc::new(classifier),
            quality,
            AttemptTiming::from(&config),
        ));
        let pool = WorkerPool::spawn(
            config.worker_count,
            Arc::clone(&table),
            orchestrator,
            shutdown.clone(),
        );

        tasks.spawn(status::run(
            Arc::clone(&table),
            broadcaster.clone(),
            config.worker_count,
            config.system_status_interval,
            shutdown.clone(),
        ));
        tasks.spawn(janitor::run(
            Arc::clone(&table),
            store.clone(),
            config.job_retention,
            shutdown.clone(),
        ));

        tracing::info!(
            worker_count = config.worker_count,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            attempt_timeout_secs = config.attempt_timeout.as_secs(),
            persistence = store.is_some(),
            "Generation service started",
        );

        Arc::new(GenerationService {
            config,
            table,
            broadcaster,
            store,
            pool,
            tasks,
            shutdown,
            event_tasks,
            event_cancel,
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct GenerationService {
    config: PipelineConfig,
    table: Arc<JobTable>,
    broadcaster: ProgressBroadcaster,
    store: Option<Arc<dyn JobStore>>,
    pool: WorkerPool,
    /// Quality runs, status reporter, janitor.
    tasks: TaskTracker,
    shutdown: CancellationToken,
    /// Broadcaster and persistence writer.
    event_tasks: TaskTracker,
    event_cancel: CancellationToken,
}

impl GenerationService {
    pub fn builder(config: PipelineConfig, gateway: Arc<dyn RenderGateway>) -> GenerationServiceBuilder {
        GenerationServiceBuilder {
            config,
            gateway,
            quality_gate: None,
            store: None,
            classifier: ErrorClassifier::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Accept a job under a fresh time-ordered id. Work starts
    /// asynchronously.
    pub fn enqueue(&self, parameters: GenerationParams) -> Result<JobId, CoreError> {
        self.enqueue_with_id(JobId::generate(), parameters)
    }

    /// Accept a job under a caller-chosen id.
    pub fn enqueue_with_id(&self, id: JobId, parameters: GenerationParams) -> Result<JobId, CoreError> {
        if id.as_str().is_empty() {
            return Err(CoreError::Validation("Job id must not be empty".to_string()));
        }
        validate_params(&parameters)?;

        let job = self.table.insert(id, parameters)?;
        tracing::info!(
            job_id = %job.id,
            queue_position = job.queue_position.unwrap_or_default(),
            "Job enqueued",
        );
        Ok(job.id)
    }

    /// Current snapshot, from memory or, once evicted, from the store.
    pub async fn get_status(&self, id: &JobId) -> Result<Job, CoreError> {
        if let Some(job) = self.table.get(id) {
            return Ok(job);
        }
        self.load_stored(id).await?.ok_or_else(|| not_found(id))
    }

    /// Snapshot followed by live events until the job's final event.
    ///
    /// A job only found in the store is already terminal, so its stream is
    /// the single stored snapshot.
    pub async fn subscribe(&self, id: &JobId) -> Result<Subscription<ProgressEvent>, CoreError> {
        if let Some(subscription) = self.table.subscribe(id) {
            return Ok(subscription);
        }
        match self.load_stored(id).await? {
            Some(job) => Ok(Subscription::once(job.progress_event())),
            None => Err(not_found(id)),
        }
    }

    /// Aggregate status stream, starting with the current counts.
    pub fn subscribe_system(&self) -> Subscription<SystemStatus> {
        self.broadcaster.watch_system(Some(self.system_status()))
    }

    pub fn system_status(&self) -> SystemStatus {
        status::snapshot(&self.table, self.pool.worker_count())
    }

    /// Request cancellation. Returns the job as it stands after the call;
    /// a job being driven finalizes as `Cancelled` shortly after.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, CoreError> {
        match self.table.cancel(id) {
            Err(CoreError::NotFound { .. }) => {
                // Evicted jobs are terminal; cancelling them is a no-op.
                self.load_stored(id).await?.ok_or_else(|| not_found(id))
            }
            other => other,
        }
    }

    /// Stop intake, cancel queued jobs, let in-flight jobs finish within
    /// the shutdown timeout (cancelling them after it), then stop every
    /// background task after flushing pending events and writes.
    pub async fn shutdown(&self) {
        let cancelled = self.table.close();
        tracing::info!(cancelled_queued = cancelled, "Generation service shutting down");
        self.shutdown.cancel();

        if tokio::time::timeout(self.config.shutdown_timeout, self.pool.join())
            .await
            .is_err()
        {
            let signalled = self.table.cancel_leased();
            tracing::warn!(
                signalled,
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "In-flight jobs did not finish in time, cancelling",
            );
            self.pool.join().await;
        }

        self.tasks.close();
        self.tasks.wait().await;

        self.event_cancel.cancel();
        self.event_tasks.close();
        self.event_tasks.wait().await;

        tracing::info!("Generation service stopped");
    }

    async fn load_stored(&self, id: &JobId) -> Result<Option<Job>, CoreError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        store.load(id).await.map_err(|e| {
            tracing::error!(job_id = %id, error = %e, "Failed to load stored job");
            CoreError::Internal(format!("Failed to load job {id}"))
        })
    }
}

fn not_found(id: &JobId) -> CoreError {
    CoreError::NotFound {
        entity: "job",
        id: id.to_string(),
    }
}

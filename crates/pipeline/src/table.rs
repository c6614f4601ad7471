//! The in-memory job table: the single coordinator of job state.
//!
//! Every mutation happens under one mutex, and every mutation that should
//! be observed emits its [`ProgressEvent`] while that mutex is still held.
//! This gives each job one total order of events, which the broadcaster
//! relays as-is and the persistence writer stores in the same order.
//!
//! Workers obtain a [`JobLease`] from [`JobTable::next_lease`]. The lease
//! is not cloneable and is the only handle through which a dispatched
//! job's state can change, so at most one worker ever drives a job.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use kiln_core::classifier::ErrorCategory;
use kiln_core::error::CoreError;
use kiln_core::job::{Artifact, Job, JobError, JobState};
use kiln_core::job_events::{ProgressEvent, StateCounts};
use kiln_core::params::GenerationParams;
use kiln_core::quality_gate::QualityResult;
use kiln_core::types::{JobId, Timestamp};
use kiln_events::{ProgressBroadcaster, Subscription};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::store::PersistHandle;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Entry {
    job: Job,
    /// Fired to ask the owning worker to stop.
    cancel: CancellationToken,
    leased: bool,
}

#[derive(Default)]
struct TableState {
    jobs: HashMap<JobId, Entry>,
    /// FIFO intake queue of job ids in `Queued` state, not yet leased.
    queue: VecDeque<JobId>,
    closed: bool,
}

pub struct JobTable {
    state: Mutex<TableState>,
    work_available: Notify,
    broadcaster: ProgressBroadcaster,
    persist: Option<PersistHandle>,
}

/// Whether a mutation is a state transition worth persisting, or only a
/// progress tick.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Durability {
    Persist,
    Transient,
}

impl JobTable {
    pub fn new(broadcaster: ProgressBroadcaster, persist: Option<PersistHandle>) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            work_available: Notify::new(),
            broadcaster,
            persist,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bump the job's sequence, publish the event and (optionally) hand the
    /// record to the persistence writer. Must be called with the lock held.
    fn emit(&self, job: &mut Job, durability: Durability) -> ProgressEvent {
        job.heartbeat_at = chrono::Utc::now();
        let event = job.next_event();
        self.broadcaster.publish(event.clone());
        if durability == Durability::Persist {
            if let Some(persist) = &self.persist {
                persist.save(job.clone());
            }
        }
        event
    }

    /// Re-publish queue positions after the queue changed shape.
    fn renumber_queue(&self, state: &mut TableState) {
        let TableState { jobs, queue, .. } = state;
        for (index, id) in queue.iter().enumerate() {
            let Some(entry) = jobs.get_mut(id) else {
                continue;
            };
            let position = Some(index + 1);
            if entry.job.queue_position != position {
                entry.job.queue_position = position;
                self.emit(&mut entry.job, Durability::Transient);
            }
        }
    }

    // ---- intake ----

    /// Track a new job at the back of the queue.
    pub fn insert(&self, id: JobId, parameters: GenerationParams) -> Result<Job, CoreError> {
        let mut state = self.lock();
        if state.closed {
            return Err(CoreError::Conflict(
                "Service is shutting down and no longer accepts jobs".to_string(),
            ));
        }
        if state.jobs.contains_key(&id) {
            return Err(CoreError::Conflict(format!("Job {id} already exists")));
        }

        let mut job = Job::new(id.clone(), parameters);
        job.queue_position = Some(state.queue.len() + 1);
        self.emit(&mut job, Durability::Persist);
        let snapshot = job.clone();

        state.queue.push_back(id.clone());
        state.jobs.insert(
            id,
            Entry {
                job,
                cancel: CancellationToken::new(),
                leased: false,
            },
        );
        drop(state);

        self.work_available.notify_one();
        Ok(snapshot)
    }

    /// Wait for the next queued job and lease it.
    ///
    /// Returns `None` once the table is closed or `shutdown` fires.
    pub async fn next_lease(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Option<JobLease> {
        loop {
            // Register interest before looking at the queue so an insert
            // landing in between still wakes this worker.
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_lease() {
                return Some(lease);
            }
            if self.lock().closed {
                return None;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    fn try_lease(self: &Arc<Self>) -> Option<JobLease> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let id = state.queue.pop_front()?;
        let entry = state.jobs.get_mut(&id)?;
        entry.leased = true;
        entry.job.queue_position = None;
        let cancel = entry.cancel.clone();
        self.renumber_queue(&mut state);
        let more_queued = !state.queue.is_empty();
        drop(state);

        // Pass the wake-up on to another idle worker.
        if more_queued {
            self.work_available.notify_one();
        }
        Some(JobLease {
            table: Arc::clone(self),
            id,
            cancel,
        })
    }

    // ---- caller surface ----

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.get(id).map(|entry| entry.job.clone())
    }

    /// Snapshot plus live events, registered atomically with respect to
    /// every emitted event.
    pub fn subscribe(&self, id: &JobId) -> Option<Subscription<ProgressEvent>> {
        let state = self.lock();
        let entry = state.jobs.get(id)?;
        Some(self.broadcaster.watch(entry.job.progress_event()))
    }

    /// Cancel a job.
    ///
    /// A queued job is removed from the queue and finalized here; a leased
    /// job is signalled and its worker finalizes it. Cancelling a terminal
    /// job is a no-op. Returns the job as it is after the call.
    pub fn cancel(&self, id: &JobId) -> Result<Job, CoreError> {
        let mut state = self.lock();
        let entry = state.jobs.get_mut(id).ok_or_else(|| CoreError::NotFound {
            entity: "job",
            id: id.to_string(),
        })?;

        if entry.job.state.is_terminal() {
            return Ok(entry.job.clone());
        }
        if entry.leased {
            entry.cancel.cancel();
            return Ok(entry.job.clone());
        }

        finalize_cancelled(&mut entry.job);
        self.emit(&mut entry.job, Durability::Persist);
        let snapshot = entry.job.clone();
        state.queue.retain(|queued| queued != id);
        self.renumber_queue(&mut state);

        tracing::info!(job_id = %id, "Queued job cancelled");
        Ok(snapshot)
    }

    pub fn counts(&self) -> StateCounts {
        self.lock().jobs.values().map(|entry| entry.job.state).collect()
    }

    /// Attach the quality result of a completed job.
    pub fn attach_quality(&self, id: &JobId, result: QualityResult) {
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(id) else {
            return;
        };
        entry.job.quality = Some(result);
        if let Some(persist) = &self.persist {
            persist.save(entry.job.clone());
        }
    }

    /// Drop terminal jobs that completed before `cutoff`. Returns how many.
    pub fn evict_completed_before(&self, cutoff: Timestamp) -> usize {
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, entry| match entry.job.completed_at {
            Some(completed_at) => !entry.job.state.is_terminal() || completed_at >= cutoff,
            None => true,
        });
        before - state.jobs.len()
    }

    // ---- shutdown ----

    /// Stop accepting and handing out jobs, and cancel everything still
    /// queued. Returns the number of queued jobs cancelled.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let queued: Vec<JobId> = state.queue.drain(..).collect();
        for id in &queued {
            if let Some(entry) = state.jobs.get_mut(id) {
                finalize_cancelled(&mut entry.job);
                self.emit(&mut entry.job, Durability::Persist);
            }
        }
        drop(state);

        self.work_available.notify_waiters();
        queued.len()
    }

    /// Signal every leased job to stop. Returns how many were signalled.
    pub fn cancel_leased(&self) -> usize {
        let state = self.lock();
        state
            .jobs
            .values()
            .filter(|entry| entry.leased && !entry.job.state.is_terminal())
            .inspect(|entry| entry.cancel.cancel())
            .count()
    }
}

fn finalize_cancelled(job: &mut Job) {
    job.state = JobState::Cancelled;
    job.queue_position = None;
    job.completed_at = Some(chrono::Utc::now());
}

// ---------------------------------------------------------------------------
// JobLease
// ---------------------------------------------------------------------------

/// Exclusive right to drive one job.
///
/// Dropping a lease whose job is not yet terminal fails the job, so a
/// worker that stops unexpectedly never leaves a job stranded mid-flight.
pub struct JobLease {
    table: Arc<JobTable>,
    id: JobId,
    cancel: CancellationToken,
}

impl JobLease {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Fires when a caller or shutdown asks this job to stop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current copy of the job.
    pub fn snapshot(&self) -> Option<Job> {
        self.table.get(&self.id)
    }

    fn update(&self, durability: Durability, f: impl FnOnce(&mut Job) -> bool) -> Option<Job> {
        let mut state = self.table.lock();
        let entry = state.jobs.get_mut(&self.id)?;
        if entry.job.state.is_terminal() {
            return None;
        }
        if f(&mut entry.job) {
            self.table.emit(&mut entry.job, durability);
        }
        Some(entry.job.clone())
    }

    /// `Queued -> Submitting` for the first attempt.
    pub fn begin(&self) -> Option<Job> {
        self.update(Durability::Persist, |job| {
            job.state = JobState::Submitting;
            true
        })
    }

    /// `Submitting -> Polling` once the engine accepted the attempt.
    pub fn submitted(&self, handle: &str) -> Option<Job> {
        self.update(Durability::Persist, |job| {
            job.state = JobState::Polling;
            job.handle = Some(handle.to_string());
            true
        })
    }

    /// Raise the progress of the current attempt. Lower or equal values
    /// are ignored, so progress never decreases within an attempt.
    pub fn progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.update(Durability::Transient, |job| {
            if percent <= job.progress {
                return false;
            }
            job.progress = percent;
            true
        });
    }

    /// An attempt failed and recovery is being planned.
    pub fn recovering(&self, error: JobError) -> Option<Job> {
        self.update(Durability::Persist, |job| {
            job.state = JobState::Recovering;
            job.last_error = Some(error);
            true
        })
    }

    /// `Recovering -> Submitting` for the next attempt, with the parameters
    /// recovery chose. Progress restarts at 0 and the old handle is dropped.
    pub fn resubmit(&self, parameters: GenerationParams) -> Option<Job> {
        self.update(Durability::Persist, |job| {
            job.state = JobState::Submitting;
            job.attempt += 1;
            job.progress = 0;
            job.handle = None;
            job.parameters = parameters;
            true
        })
    }

    /// Terminal success.
    pub fn complete(&self, output: Vec<Artifact>) -> Option<Job> {
        self.update(Durability::Persist, |job| {
            job.state = JobState::Completed;
            job.progress = 100;
            job.output = Some(output);
            job.last_error = None;
            job.completed_at = Some(chrono::Utc::now());
            true
        })
    }

    /// Terminal failure carrying the last classified error.
    pub fn fail(&self, error: JobError) -> Option<Job> {
        self.update(Durability::Persist, |job| {
            job.state = JobState::Failed;
            job.last_error = Some(error);
            job.completed_at = Some(chrono::Utc::now());
            true
        })
    }

    /// Terminal cancellation.
    pub fn cancelled(&self) -> Option<Job> {
        self.update(Durability::Persist, |job| {
            finalize_cancelled(job);
            true
        })
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        let abandoned = self.fail(JobError {
            category: ErrorCategory::Unknown,
            message: "Worker stopped before the job finished".to_string(),
        });
        if abandoned.is_some() {
            tracing::error!(job_id = %self.id, "Job lease dropped before a terminal state");
        }

        let mut state = self.table.lock();
        if let Some(entry) = state.jobs.get_mut(&self.id) {
            entry.leased = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::params::ParamValue;
    use tokio_util::task::TaskTracker;

    use super::*;

    fn table() -> (Arc<JobTable>, CancellationToken) {
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();
        let broadcaster = ProgressBroadcaster::spawn(64, &tasks, cancel.clone());
        (Arc::new(JobTable::new(broadcaster, None)), cancel)
    }

    fn params() -> GenerationParams {
        GenerationParams::from([("width".to_string(), ParamValue::Int(512))])
    }

    #[tokio::test]
    async fn insert_assigns_queue_positions() {
        let (table, _) = table();
        let a = table.insert(JobId::new("a"), params()).unwrap();
        let b = table.insert(JobId::new("b"), params()).unwrap();
        assert_eq!(a.queue_position, Some(1));
        assert_eq!(b.queue_position, Some(2));
        assert_eq!(a.seq, 1);
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let (table, _) = table();
        table.insert(JobId::new("a"), params()).unwrap();
        let err = table.insert(JobId::new("a"), params()).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn leasing_is_fifo_and_renumbers_queue() {
        let (table, shutdown) = table();
        for id in ["a", "b", "c"] {
            table.insert(JobId::new(id), params()).unwrap();
        }

        let lease = table.next_lease(&shutdown).await.unwrap();
        assert_eq!(lease.id().as_str(), "a");
        assert_eq!(table.get(&JobId::new("b")).unwrap().queue_position, Some(1));
        assert_eq!(table.get(&JobId::new("c")).unwrap().queue_position, Some(2));
        lease.cancelled();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn back_to_back_inserts_wake_every_idle_worker() {
        for round in 0..20 {
            let (table, shutdown) = table();
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move { table.next_lease(&shutdown).await })
                })
                .collect();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;

            table.insert(JobId::new(format!("a-{round}")), params()).unwrap();
            table.insert(JobId::new(format!("b-{round}")), params()).unwrap();

            for worker in workers {
                let lease = tokio::time::timeout(std::time::Duration::from_secs(1), worker)
                    .await
                    .expect("idle worker was not woken")
                    .unwrap()
                    .expect("worker got no lease");
                lease.cancelled();
            }
        }
    }

    #[tokio::test]
    async fn cancelling_queued_job_removes_it_from_queue() {
        let (table, shutdown) = table();
        table.insert(JobId::new("a"), params()).unwrap();
        table.insert(JobId::new("b"), params()).unwrap();

        let job = table.cancel(&JobId::new("a")).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.completed_at.is_some());

        let lease = table.next_lease(&shutdown).await.unwrap();
        assert_eq!(lease.id().as_str(), "b");
        lease.cancelled();
    }

    #[tokio::test]
    async fn cancelling_leased_job_signals_worker() {
        let (table, shutdown) = table();
        table.insert(JobId::new("a"), params()).unwrap();
        let lease = table.next_lease(&shutdown).await.unwrap();

        let job = table.cancel(lease.id()).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(lease.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_attempt_and_resets_on_resubmit() {
        let (table, shutdown) = table();
        table.insert(JobId::new("a"), params()).unwrap();
        let lease = table.next_lease(&shutdown).await.unwrap();
        lease.begin();
        lease.submitted("h1");
        lease.progress(40);
        lease.progress(20);
        assert_eq!(lease.snapshot().unwrap().progress, 40);

        lease.recovering(JobError {
            category: ErrorCategory::TransientNetwork,
            message: "connection reset".into(),
        });
        let job = lease.resubmit(params()).unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.progress, 0);
        assert_eq!(job.handle, None);
        lease.cancelled();
    }

    #[tokio::test]
    async fn terminal_jobs_ignore_further_updates() {
        let (table, shutdown) = table();
        table.insert(JobId::new("a"), params()).unwrap();
        let lease = table.next_lease(&shutdown).await.unwrap();
        lease.begin();
        let done = lease.complete(vec![Artifact::new("out.png")]).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(lease.fail(JobError {
            category: ErrorCategory::Unknown,
            message: "late".into(),
        })
        .is_none());
    }

    #[tokio::test]
    async fn dropped_lease_fails_job() {
        let (table, shutdown) = table();
        table.insert(JobId::new("a"), params()).unwrap();
        let lease = table.next_lease(&shutdown).await.unwrap();
        lease.begin();
        drop(lease);

        let job = table.get(&JobId::new("a")).unwrap();
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn close_cancels_queue_and_stops_leasing() {
        let (table, shutdown) = table();
        table.insert(JobId::new("a"), params()).unwrap();
        assert_eq!(table.close(), 1);
        assert_eq!(table.get(&JobId::new("a")).unwrap().state, JobState::Cancelled);
        assert!(table.next_lease(&shutdown).await.is_none());
        assert!(table.insert(JobId::new("b"), params()).is_err());
    }

    #[tokio::test]
    async fn eviction_only_removes_old_terminal_jobs() {
        let (table, _) = table();
        table.insert(JobId::new("queued"), params()).unwrap();
        table.insert(JobId::new("done"), params()).unwrap();
        table.cancel(&JobId::new("done")).unwrap();

        assert_eq!(table.evict_completed_before(chrono::Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(table.evict_completed_before(chrono::Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(table.get(&JobId::new("queued")).is_some());
        assert!(table.get(&JobId::new("done")).is_none());
    }
}

//! Per-job state machine.
//!
//! `Queued -> Submitting -> Polling -> {Completed | Recovering | Failed}`,
//! with `Recovering -> Submitting` as the retry loop. Cancellation can end
//! the job from any non-terminal state and is never classified as an error.

use std::sync::Arc;
use std::time::Duration;

use kiln_comfyui::{EngineHandle, EngineStatus, GatewayError, RenderGateway};
use kiln_core::classifier::{ErrorCategory, ErrorClassifier};
use kiln_core::job::Artifact;
use kiln_core::params::GenerationParams;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PipelineConfig;
use crate::quality::QualityRunner;
use crate::recovery::{plan_recovery, Failure, GiveUp, RecoveryPlan};
use crate::table::JobLease;

/// How a single submit-and-poll attempt ended.
#[derive(Debug)]
enum AttemptOutcome {
    Done(Vec<Artifact>),
    Cancelled,
    Failed(Failure),
}

/// Timing knobs the state machine needs from [`PipelineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct AttemptTiming {
    pub poll_interval: Duration,
    pub attempt_timeout: Duration,
    pub backoff_unit: Duration,
    pub backoff_cap: Duration,
}

impl From<&PipelineConfig> for AttemptTiming {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            attempt_timeout: config.attempt_timeout,
            backoff_unit: config.backoff_unit,
            backoff_cap: config.backoff_cap,
        }
    }
}

pub struct Orchestrator {
    gateway: Arc<dyn RenderGateway>,
    classifier: Arc<ErrorClassifier>,
    quality: QualityRunner,
    timing: AttemptTiming,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn RenderGateway>,
        classifier: Arc<ErrorClassifier>,
        quality: QualityRunner,
        timing: AttemptTiming,
    ) -> Self {
        Self {
            gateway,
            classifier,
            quality,
            timing,
        }
    }

    /// Drive one leased job to a terminal state.
    pub async fn drive(&self, lease: JobLease) {
        let job_id = lease.id().clone();

        // Cancelled between dequeue and start: never touch the engine.
        if lease.cancel_token().is_cancelled() {
            lease.cancelled();
            tracing::info!(job_id = %job_id, "Job cancelled before submission");
            return;
        }
        let Some(mut job) = lease.begin() else {
            return;
        };

        loop {
            match self.run_attempt(&lease, &job.parameters).await {
                AttemptOutcome::Done(outputs) => {
                    lease.complete(outputs.clone());
                    tracing::info!(
                        job_id = %job_id,
                        attempt = job.attempt,
                        outputs = outputs.len(),
                        "Job completed",
                    );
                    self.quality.spawn(job_id, outputs);
                    return;
                }
                AttemptOutcome::Cancelled => {
                    lease.cancelled();
                    tracing::info!(job_id = %job_id, attempt = job.attempt, "Job cancelled");
                    return;
                }
                AttemptOutcome::Failed(failure) => {
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = job.attempt,
                        category = %failure.category,
                        error = %failure.message,
                        "Attempt failed",
                    );
                    lease.recovering(failure.clone().into());

                    let policy = self.classifier.policy_for(failure.category);
                    let plan = plan_recovery(
                        policy,
                        job.attempt,
                        &job.parameters,
                        self.timing.backoff_unit,
                        self.timing.backoff_cap,
                    );

                    let (delay, parameters) = match plan {
                        RecoveryPlan::Fail(reason) => {
                            let reason = match reason {
                                GiveUp::Aborted => "category aborts",
                                GiveUp::Exhausted => "retries exhausted",
                            };
                            tracing::info!(
                                job_id = %job_id,
                                attempt = job.attempt,
                                category = %failure.category,
                                reason,
                                "Job failed",
                            );
                            lease.fail(failure.into());
                            return;
                        }
                        RecoveryPlan::Resubmit { delay, parameters } => (delay, parameters),
                    };

                    tracing::info!(
                        job_id = %job_id,
                        next_attempt = job.attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        strategy = ?policy.strategy,
                        "Recovering job",
                    );
                    tokio::select! {
                        _ = lease.cancel_token().cancelled() => {
                            lease.cancelled();
                            tracing::info!(job_id = %job_id, "Job cancelled during recovery");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    match lease.resubmit(parameters) {
                        Some(next) => job = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Submit once and poll until a terminal status, cancellation or the
    /// attempt deadline.
    async fn run_attempt(&self, lease: &JobLease, parameters: &GenerationParams) -> AttemptOutcome {
        let cancel = lease.cancel_token();
        let deadline = Instant::now() + self.timing.attempt_timeout;

        // Submission is not interrupted by cancellation so a handle that
        // the engine did accept can still be cancelled remotely.
        let handle = match tokio::time::timeout_at(deadline, self.gateway.submit(parameters)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return AttemptOutcome::Failed(self.classify(&e.to_string())),
            Err(_) => return AttemptOutcome::Failed(self.timed_out()),
        };
        if cancel.is_cancelled() {
            self.cancel_remote(&handle).await;
            return AttemptOutcome::Cancelled;
        }
        lease.submitted(handle.as_str());
        tracing::info!(job_id = %lease.id(), handle = %handle, "Job submitted");

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.timing.poll_interval,
            self.timing.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_remote(&handle).await;
                    return AttemptOutcome::Cancelled;
                }
                _ = &mut expired => {
                    self.cancel_remote(&handle).await;
                    return AttemptOutcome::Failed(self.timed_out());
                }
                _ = ticker.tick() => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    _ = &mut expired => None,
                    status = self.gateway.poll(&handle) => Some(status),
                },
            };
            // Cancel or deadline fired mid-poll; the outer select handles it.
            let Some(status) = polled else {
                continue;
            };

            match status {
                Ok(EngineStatus::Pending) => {
                    tracing::debug!(job_id = %lease.id(), "Render engine reports pending");
                }
                Ok(EngineStatus::Running(percent)) => {
                    tracing::debug!(job_id = %lease.id(), percent, "Render engine reports progress");
                    lease.progress(percent);
                }
                Ok(EngineStatus::Done(outputs)) => return AttemptOutcome::Done(outputs),
                Ok(EngineStatus::Failed(message)) => {
                    return AttemptOutcome::Failed(self.classify(&message));
                }
                Err(e) => {
                    self.gateway.release(&handle);
                    return AttemptOutcome::Failed(self.classify(&e.to_string()));
                }
            }
        }
    }

    fn classify(&self, message: &str) -> Failure {
        let (category, _) = self.classifier.classify(message);
        Failure::new(category, message)
    }

    fn timed_out(&self) -> Failure {
        Failure::new(
            ErrorCategory::TransientTimeout,
            format!(
                "Attempt timed out after {}s without a terminal status",
                self.timing.attempt_timeout.as_secs_f64()
            ),
        )
    }

    /// Best-effort cancel on the engine; the local outcome does not depend on it.
    async fn cancel_remote(&self, handle: &EngineHandle) {
        match self.gateway.cancel(handle).await {
            Ok(()) => {}
            Err(GatewayError::Unsupported(_)) => {
                tracing::debug!(handle = %handle, "Render engine has no cancel primitive");
            }
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "Failed to cancel on render engine");
            }
        }
    }
}

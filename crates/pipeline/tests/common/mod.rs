#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_comfyui::{EngineHandle, EngineStatus, GatewayError, RenderGateway};
use kiln_core::job::{Artifact, Job};
use kiln_core::job_events::ProgressEvent;
use kiln_core::params::{GenerationParams, ParamValue};
use kiln_core::quality_gate::{QualityCriteria, QualityResult};
use kiln_core::types::{JobId, Timestamp};
use kiln_events::Subscription;
use kiln_pipeline::quality::QualityGate;
use kiln_pipeline::store::{JobStore, StoreError};
use kiln_pipeline::{GenerationService, PipelineConfig};

// ---------------------------------------------------------------------------
// Scripted render engine
// ---------------------------------------------------------------------------

/// What one submit-and-poll attempt does.
#[derive(Debug, Clone)]
pub struct Attempt {
    submit_error: Option<String>,
    submit_delay: Duration,
    polls: VecDeque<Result<EngineStatus, PollError>>,
}

/// An HTTP-level poll failure: status code and body.
pub type PollError = (u16, String);

impl Attempt {
    /// Accepted; polls answer in order, then repeat the last answer.
    pub fn polls(polls: impl IntoIterator<Item = EngineStatus>) -> Self {
        Self {
            submit_error: None,
            submit_delay: Duration::ZERO,
            polls: polls.into_iter().map(Ok).collect(),
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            submit_error: Some(message.to_string()),
            submit_delay: Duration::ZERO,
            polls: VecDeque::new(),
        }
    }

    /// Accepted, but every poll fails with the given HTTP status.
    pub fn poll_errors(status: u16, body: &str) -> Self {
        Self {
            submit_error: None,
            submit_delay: Duration::ZERO,
            polls: VecDeque::from([Err((status, body.to_string()))]),
        }
    }

    /// The submit call takes `delay` before answering.
    pub fn slow_submit(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn fails_with(message: &str) -> Self {
        Self::polls([EngineStatus::Failed(message.to_string())])
    }

    pub fn succeeds() -> Self {
        Self::polls([EngineStatus::Running(50), done()])
    }

    /// Never reaches a terminal status.
    pub fn hangs() -> Self {
        Self::polls([EngineStatus::Pending])
    }
}

pub fn done() -> EngineStatus {
    EngineStatus::Done(vec![Artifact::new("out/image_00001.png")])
}

#[derive(Default)]
struct ScriptState {
    script: VecDeque<Attempt>,
    live: HashMap<String, VecDeque<Result<EngineStatus, PollError>>>,
    submitted: Vec<GenerationParams>,
    cancelled: Vec<String>,
    released: Vec<String>,
}

/// In-memory render engine that plays back attempts in submission order.
/// Once the script runs out, every further attempt succeeds.
#[derive(Default)]
pub struct ScriptedGateway {
    state: Mutex<ScriptState>,
}

impl ScriptedGateway {
    pub fn new(script: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptState {
                script: script.into_iter().collect(),
                ..Default::default()
            }),
        })
    }

    pub fn submitted(&self) -> Vec<GenerationParams> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }
}

#[async_trait]
impl RenderGateway for ScriptedGateway {
    async fn submit(&self, params: &GenerationParams) -> Result<EngineHandle, GatewayError> {
        let (attempt, number) = {
            let mut state = self.state.lock().unwrap();
            state.submitted.push(params.clone());
            let attempt = state.script.pop_front().unwrap_or_else(Attempt::succeeds);
            (attempt, state.submitted.len())
        };
        if !attempt.submit_delay.is_zero() {
            tokio::time::sleep(attempt.submit_delay).await;
        }

        if let Some(message) = attempt.submit_error {
            return Err(GatewayError::Protocol(message));
        }
        let handle = format!("prompt-{number}");
        self.state
            .lock()
            .unwrap()
            .live
            .insert(handle.clone(), attempt.polls);
        Ok(EngineHandle::new(handle))
    }

    async fn poll(&self, handle: &EngineHandle) -> Result<EngineStatus, GatewayError> {
        let mut state = self.state.lock().unwrap();
        let polls = state
            .live
            .get_mut(handle.as_str())
            .ok_or_else(|| GatewayError::Protocol(format!("unknown handle {handle}")))?;

        let next = if polls.len() > 1 {
            polls.pop_front()
        } else {
            polls.front().cloned()
        };
        match next.unwrap_or(Ok(EngineStatus::Pending)) {
            Ok(status) => Ok(status),
            Err((status, body)) => Err(GatewayError::Api { status, body }),
        }
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), GatewayError> {
        self.state
            .lock()
            .unwrap()
            .cancelled
            .push(handle.as_str().to_string());
        Ok(())
    }

    fn release(&self, handle: &EngineHandle) {
        self.state
            .lock()
            .unwrap()
            .released
            .push(handle.as_str().to_string());
    }
}

// ---------------------------------------------------------------------------
// Quality gate and store doubles
// ---------------------------------------------------------------------------

/// Passes every job with a fixed score.
pub struct FixedQualityGate(pub f64);

#[async_trait]
impl QualityGate for FixedQualityGate {
    async fn score(&self, _artifacts: &[Artifact], _criteria: &QualityCriteria) -> QualityResult {
        QualityResult {
            score: self.0,
            passed: true,
            issues: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    saves: Mutex<Vec<(JobId, kiln_core::job::JobState)>>,
}

impl MemoryStore {
    pub fn seed(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }

    pub fn saved(&self, id: &JobId) -> Option<Job> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// States written for `id`, in write order.
    pub fn history(&self, id: &JobId) -> Vec<kiln_core::job::JobState> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|(saved, _)| saved == id)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        self.saves.lock().unwrap().push((job.id.clone(), job.state));
        self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn purge_before(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| job.completed_at.map_or(true, |at| at >= cutoff));
        Ok((before - jobs.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fast timings so scenarios finish in milliseconds.
pub fn test_config(worker_count: usize) -> PipelineConfig {
    PipelineConfig {
        worker_count,
        poll_interval: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(5),
        backoff_unit: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn start(config: PipelineConfig, gateway: Arc<ScriptedGateway>) -> Arc<GenerationService> {
    GenerationService::builder(config, gateway)
        .quality_gate(Arc::new(FixedQualityGate(0.9)))
        .start()
}

pub fn params(pairs: &[(&str, i64)]) -> GenerationParams {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), ParamValue::Int(*v)))
        .collect()
}

pub fn prompt(text: &str) -> GenerationParams {
    GenerationParams::from([("prompt".to_string(), ParamValue::Text(text.to_string()))])
}

/// Read events until the subscription ends.
pub async fn drain(mut subscription: Subscription<ProgressEvent>) -> Vec<ProgressEvent> {
    tokio::time::timeout(Duration::from_secs(10), async move {
        let mut events = Vec::new();
        while let Some(event) = subscription.recv().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("job did not finish in time")
}

/// Wait for the job to reach a terminal state and return it.
pub async fn wait_terminal(service: &GenerationService, id: &JobId) -> Job {
    let subscription = service.subscribe(id).await.unwrap();
    let events = drain(subscription).await;
    assert!(events.last().is_some_and(|e| e.is_final()), "stream ended without a final event");
    service.get_status(id).await.unwrap()
}

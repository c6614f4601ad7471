//! Per-prompt progress reported over the WebSocket.
//!
//! The listener writes, the gateway's `poll` reads. A prompt's percentage
//! only ever moves up and is capped below 100 until history confirms the
//! prompt is done.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Highest percentage reported for a prompt that is still running.
pub const RUNNING_CAP: u8 = 99;

#[derive(Debug, Default)]
pub struct ProgressTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    percent: HashMap<String, u8>,
    /// Prompt most recently seen executing, for progress messages that
    /// carry no prompt id.
    current: Option<String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A prompt started executing.
    pub fn started(&self, prompt_id: &str) {
        let mut state = self.lock();
        state.percent.entry(prompt_id.to_string()).or_insert(0);
        state.current = Some(prompt_id.to_string());
    }

    /// Record step progress. `prompt_id == None` targets the prompt most
    /// recently seen executing.
    pub fn record(&self, prompt_id: Option<&str>, percent: u8) {
        let mut state = self.lock();
        let Some(id) = prompt_id.map(str::to_string).or_else(|| state.current.clone()) else {
            return;
        };
        let capped = percent.min(RUNNING_CAP);
        let slot = state.percent.entry(id).or_insert(0);
        *slot = (*slot).max(capped);
    }

    /// The prompt stopped executing, one way or another.
    pub fn finished(&self, prompt_id: &str) {
        let mut state = self.lock();
        if state.current.as_deref() == Some(prompt_id) {
            state.current = None;
        }
    }

    /// Latest percentage for a prompt, if any progress was seen.
    pub fn percent(&self, prompt_id: &str) -> Option<u8> {
        self.lock().percent.get(prompt_id).copied()
    }

    /// Drop all state for a prompt once its attempt is over.
    pub fn forget(&self, prompt_id: &str) {
        let mut state = self.lock();
        state.percent.remove(prompt_id);
        if state.current.as_deref() == Some(prompt_id) {
            state.current = None;
        }
    }
}

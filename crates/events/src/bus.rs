//! In-process fan-out of job progress and system status.
//!
//! Producers hand events to [`ProgressBroadcaster`] without ever blocking:
//! commands go over an unbounded channel to a single fan-out task, which
//! owns the observer lists and delivers to each observer's bounded channel
//! with `try_send`. An observer whose buffer is full is dropped rather than
//! allowed to stall the job or other observers.

use std::collections::HashMap;

use kiln_core::job_events::{ProgressEvent, SystemStatus};
use kiln_core::types::JobId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::subscription::Subscription;

/// Default per-observer buffer.
pub const DEFAULT_OBSERVER_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum Command {
    Publish(ProgressEvent),
    Watch {
        job_id: JobId,
        after_seq: u64,
        tx: mpsc::Sender<ProgressEvent>,
    },
    PublishSystem(SystemStatus),
    WatchSystem(mpsc::Sender<SystemStatus>),
}

// ---------------------------------------------------------------------------
// ProgressBroadcaster
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to the fan-out task.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    commands: mpsc::UnboundedSender<Command>,
    buffer: usize,
}

impl ProgressBroadcaster {
    /// Spawn the fan-out task on `tasks`.
    ///
    /// The task runs until `cancel` fires, then delivers whatever was
    /// already published and exits, closing every open subscription.
    pub fn spawn(buffer: usize, tasks: &TaskTracker, cancel: CancellationToken) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tasks.spawn(run_fan_out(rx, cancel));
        Self {
            commands,
            buffer: buffer.max(1),
        }
    }

    /// Relay a job event to that job's observers.
    pub fn publish(&self, event: ProgressEvent) {
        // Only fails once the fan-out task is gone, i.e. during shutdown.
        let _ = self.commands.send(Command::Publish(event));
    }

    pub fn publish_system(&self, status: SystemStatus) {
        let _ = self.commands.send(Command::PublishSystem(status));
    }

    /// Register an observer of one job, starting from `snapshot`.
    ///
    /// The snapshot is delivered first; afterwards only events with a
    /// higher `seq` are. For a terminal snapshot the subscription ends
    /// right after it. Callers must take the snapshot and call this
    /// while holding whatever lock orders their `publish` calls, so no
    /// event can fall between the two.
    pub fn watch(&self, snapshot: ProgressEvent) -> Subscription<ProgressEvent> {
        if snapshot.is_final() {
            return Subscription::once(snapshot);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let job_id = snapshot.job_id.clone();
        let after_seq = snapshot.seq;
        let _ = tx.try_send(snapshot);
        let _ = self.commands.send(Command::Watch {
            job_id,
            after_seq,
            tx,
        });
        Subscription::new(rx)
    }

    /// Register a system-status observer, optionally seeded with the
    /// latest aggregate.
    pub fn watch_system(&self, initial: Option<SystemStatus>) -> Subscription<SystemStatus> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if let Some(status) = initial {
            let _ = tx.try_send(status);
        }
        let _ = self.commands.send(Command::WatchSystem(tx));
        Subscription::new(rx)
    }
}

// ---------------------------------------------------------------------------
// Fan-out task
// ---------------------------------------------------------------------------

struct Watcher {
    /// Highest `seq` already delivered to this observer.
    after_seq: u64,
    tx: mpsc::Sender<ProgressEvent>,
}

#[derive(Default)]
struct FanOut {
    jobs: HashMap<JobId, Vec<Watcher>>,
    system: Vec<mpsc::Sender<SystemStatus>>,
}

impl FanOut {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Publish(event) => self.deliver(event),
            Command::Watch {
                job_id,
                after_seq,
                tx,
            } => self
                .jobs
                .entry(job_id)
                .or_default()
                .push(Watcher { after_seq, tx }),
            Command::PublishSystem(status) => self.deliver_system(status),
            Command::WatchSystem(tx) => self.system.push(tx),
        }
    }

    fn deliver(&mut self, event: ProgressEvent) {
        let Some(watchers) = self.jobs.get_mut(&event.job_id) else {
            return;
        };

        watchers.retain_mut(|watcher| {
            if event.seq <= watcher.after_seq {
                return true;
            }
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => {
                    watcher.after_seq = event.seq;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(job_id = %event.job_id, seq = event.seq, "Dropping slow progress observer");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        // Dropping the senders after the final event ends the subscriptions.
        if event.is_final() || watchers.is_empty() {
            self.jobs.remove(&event.job_id);
        }
    }

    fn deliver_system(&mut self, status: SystemStatus) {
        self.system.retain(|tx| match tx.try_send(status.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Dropping slow system-status observer");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn observer_count(&self) -> usize {
        self.jobs.values().map(Vec::len).sum::<usize>() + self.system.len()
    }
}

async fn run_fan_out(mut rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
    let mut fan_out = FanOut::default();

    loop {
        tokio::select! {
            biased;
            command = rx.recv() => match command {
                Some(command) => fan_out.apply(command),
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(command) = rx.try_recv() {
                    fan_out.apply(command);
                }
                break;
            }
        }
    }

    tracing::info!(
        open_observers = fan_out.observer_count(),
        "Progress broadcaster stopped"
    );
}

#[cfg(test)]
mod tests {
    use kiln_core::job::JobState;
    use kiln_core::job_events::StateCounts;

    use super::*;

    fn event(seq: u64, state: JobState, progress: u8) -> ProgressEvent {
        ProgressEvent {
            job_id: JobId::new("job-1"),
            seq,
            state,
            attempt: 1,
            progress,
            queue_position: None,
            output: None,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn spawn(buffer: usize) -> (ProgressBroadcaster, CancellationToken, TaskTracker) {
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();
        let broadcaster = ProgressBroadcaster::spawn(buffer, &tasks, cancel.clone());
        (broadcaster, cancel, tasks)
    }

    #[tokio::test]
    async fn snapshot_then_newer_events_then_end() {
        let (bus, _cancel, _tasks) = spawn(16);

        bus.publish(event(1, JobState::Queued, 0));
        let mut sub = bus.watch(event(2, JobState::Polling, 10));
        bus.publish(event(2, JobState::Polling, 10));
        bus.publish(event(3, JobState::Polling, 50));
        bus.publish(event(4, JobState::Completed, 100));

        let seqs: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.seq)
            .collect();
        // Only the snapshot is buffered synchronously.
        assert_eq!(seqs, vec![2]);

        assert_eq!(sub.recv().await.map(|e| e.seq), Some(3));
        let last = sub.recv().await.unwrap();
        assert_eq!(last.state, JobState::Completed);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminal_snapshot_ends_immediately() {
        let (bus, _cancel, _tasks) = spawn(16);
        let mut sub = bus.watch(event(9, JobState::Failed, 0));
        assert_eq!(sub.recv().await.map(|e| e.state), Some(JobState::Failed));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn every_observer_sees_the_same_order() {
        let (bus, _cancel, _tasks) = spawn(16);
        let mut a = bus.watch(event(1, JobState::Queued, 0));
        let mut b = bus.watch(event(1, JobState::Queued, 0));

        for seq in 2..=5 {
            bus.publish(event(seq, JobState::Polling, (seq * 10) as u8));
        }
        bus.publish(event(6, JobState::Cancelled, 50));

        for sub in [&mut a, &mut b] {
            let mut seqs = Vec::new();
            while let Some(e) = sub.recv().await {
                seqs.push(e.seq);
            }
            assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        }
    }

    #[tokio::test]
    async fn slow_observer_is_dropped_without_blocking_others() {
        let (bus, _cancel, _tasks) = spawn(2);
        let mut slow = bus.watch(event(1, JobState::Queued, 0));
        let mut fast = bus.watch(event(1, JobState::Queued, 0));

        bus.publish(event(2, JobState::Polling, 10));
        assert_eq!(fast.recv().await.map(|e| e.seq), Some(1));
        assert_eq!(fast.recv().await.map(|e| e.seq), Some(2));

        bus.publish(event(3, JobState::Polling, 20));
        bus.publish(event(4, JobState::Completed, 100));

        assert_eq!(fast.recv().await.map(|e| e.seq), Some(3));
        assert_eq!(fast.recv().await.map(|e| e.seq), Some(4));
        assert!(fast.recv().await.is_none());

        // The slow observer's buffer was still full at seq 3, so it was dropped.
        let mut slow_seqs = Vec::new();
        while let Some(e) = slow.recv().await {
            slow_seqs.push(e.seq);
        }
        assert_eq!(slow_seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn system_observers_receive_aggregates() {
        let (bus, cancel, tasks) = spawn(4);
        let mut sub = bus.watch_system(None);

        bus.publish_system(SystemStatus {
            counts: StateCounts {
                queued: 2,
                ..Default::default()
            },
            worker_count: 3,
            timestamp: chrono::Utc::now(),
        });

        let status = sub.recv().await.unwrap();
        assert_eq!(status.counts.queued, 2);
        assert_eq!(status.worker_count, 3);

        cancel.cancel();
        tasks.close();
        tasks.wait().await;
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_events() {
        let (bus, cancel, tasks) = spawn(16);
        let mut sub = bus.watch(event(1, JobState::Polling, 0));
        bus.publish(event(2, JobState::Cancelled, 0));
        cancel.cancel();
        tasks.close();
        tasks.wait().await;

        assert_eq!(sub.recv().await.map(|e| e.seq), Some(1));
        assert_eq!(sub.recv().await.map(|e| e.state), Some(JobState::Cancelled));
        assert!(sub.recv().await.is_none());
    }
}

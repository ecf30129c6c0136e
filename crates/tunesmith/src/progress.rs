//! Per-job progress fan-out.
//!
//! Each running job owns one broadcast channel. Publishing delivers to
//! every current subscriber; subscribing after an event was published never
//! replays it, and a slow subscriber lags rather than blocking the
//! publisher (bounded buffer, oldest events dropped). Channels are removed
//! once a job reaches a terminal state, so subscriptions against finished
//! jobs observe an immediately-closed stream.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default per-job event buffer. A subscriber further behind than this
/// starts losing the oldest buffered events.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A single progress tick emitted by a backend while training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// 0–100.
    pub progress: f32,
    pub current_epoch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    /// Backend-specific status line, e.g. `transferring 45%`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Events published for a job over its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The job moved from pending into training.
    Started { progress: f32, current_epoch: u32 },
    /// A backend progress tick, already persisted.
    Progress(ProgressUpdate),
    Completed { progress: f32, model_path: String },
    Failed { error: String },
    Cancelled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled
        )
    }
}

/// Owns the per-job broadcast channels.
pub struct ProgressHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<JobEvent>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open a channel for a job. Idempotent; an existing channel and its
    /// subscribers are left untouched.
    pub fn open(&self, job_id: &str) {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Subscribe to a job's live events. Returns `None` when no channel is
    /// open — the job already finished or was never started.
    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<JobEvent>> {
        let channels = self.channels.lock().unwrap();
        channels.get(job_id).map(|sender| sender.subscribe())
    }

    /// Deliver an event to the job's current subscribers. Events published
    /// with no channel or no subscribers are dropped.
    pub fn publish(&self, job_id: &str, event: JobEvent) {
        let channels = self.channels.lock().unwrap();
        if let Some(sender) = channels.get(job_id) {
            // send only fails when there are no receivers
            let _ = sender.send(event);
        }
    }

    /// Drop a job's channel. Pending receivers observe the stream closing
    /// after draining whatever was already buffered.
    pub fn close(&self, job_id: &str) {
        let mut channels = self.channels.lock().unwrap();
        channels.remove(job_id);
    }

    pub fn is_open(&self, job_id: &str) -> bool {
        self.channels.lock().unwrap().contains_key(job_id)
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn tick(progress: f32) -> JobEvent {
        JobEvent::Progress(ProgressUpdate {
            progress,
            current_epoch: 0,
            loss: None,
            status: None,
        })
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let hub = ProgressHub::new();
        hub.open("job_a");
        let mut first = hub.subscribe("job_a").unwrap();
        let mut second = hub.subscribe("job_a").unwrap();

        hub.publish("job_a", tick(10.0));

        assert!(matches!(first.recv().await.unwrap(), JobEvent::Progress(_)));
        assert!(matches!(second.recv().await.unwrap(), JobEvent::Progress(_)));
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let hub = ProgressHub::new();
        hub.open("job_a");
        hub.publish("job_a", tick(10.0));

        let mut late = hub.subscribe("job_a").unwrap();
        hub.publish("job_a", tick(20.0));

        match late.recv().await.unwrap() {
            JobEvent::Progress(update) => assert_eq!(update.progress, 20.0),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn closed_job_yields_no_subscription() {
        let hub = ProgressHub::new();
        hub.open("job_a");
        hub.close("job_a");
        assert!(hub.subscribe("job_a").is_none());
    }

    #[tokio::test]
    async fn close_ends_live_streams() {
        let hub = ProgressHub::new();
        hub.open("job_a");
        let mut rx = hub.subscribe("job_a").unwrap();
        hub.close("job_a");
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn jobs_are_isolated() {
        let hub = ProgressHub::new();
        hub.open("job_a");
        hub.open("job_b");
        let mut rx_a = hub.subscribe("job_a").unwrap();

        hub.publish("job_b", tick(50.0));
        hub.publish("job_a", tick(5.0));

        match rx_a.recv().await.unwrap() {
            JobEvent::Progress(update) => assert_eq!(update.progress, 5.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let hub = ProgressHub::with_capacity(2);
        hub.open("job_a");
        let mut rx = hub.subscribe("job_a").unwrap();

        for progress in [1.0, 2.0, 3.0, 4.0] {
            hub.publish("job_a", tick(progress));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        match rx.recv().await.unwrap() {
            JobEvent::Progress(update) => assert_eq!(update.progress, 3.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

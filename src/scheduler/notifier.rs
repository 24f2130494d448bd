use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::channel::ChannelInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventKind {
    Queued,
    Dispatched,
    Returned,
    Updated,
    Ended,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Queued => write!(f, "queued"),
            JobEventKind::Dispatched => write!(f, "dispatched"),
            JobEventKind::Returned => write!(f, "returned"),
            JobEventKind::Updated => write!(f, "updated"),
            JobEventKind::Ended => write!(f, "ended"),
        }
    }
}

/// Snapshot of a job taken when an event is fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub uuid: String,
    pub name: String,
    pub task_count: usize,
    pub initial_task_count: usize,
    pub priority: i32,
    pub max_channels: usize,
    pub suspended: bool,
    pub pending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub emitter: Uuid,
    pub kind: JobEventKind,
    pub job: JobInfo,
    /// Set for `Dispatched` and `Returned`
    pub channel: Option<ChannelInfo>,
    /// Tasks in the dispatched bundle, or tasks still to dispatch on return
    pub task_count: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

/// Receives job lifecycle events.
pub trait JobListener: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

impl<F> JobListener for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_event(&self, event: &JobEvent) {
        self(event)
    }
}

/// Fans job events out to registered listeners.
///
/// Delivery is synchronous and in registration order. The listener list is copied under the
/// lock and invoked outside it, so listeners may add or remove listeners. A panicking
/// listener is logged and skipped.
pub struct JobNotifier {
    emitter: Uuid,
    listeners: Mutex<Vec<Arc<dyn JobListener>>>,
    /// channels currently holding a bundle, per job uuid
    dispatches: Mutex<HashMap<String, Vec<ChannelInfo>>>,
}

impl Default for JobNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobNotifier")
            .field("emitter", &self.emitter)
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl JobNotifier {
    pub fn new() -> Self {
        Self {
            emitter: Uuid::new_v4(),
            listeners: Mutex::new(Vec::new()),
            dispatches: Mutex::new(HashMap::new()),
        }
    }

    pub fn emitter(&self) -> Uuid {
        self.emitter
    }

    pub fn add_listener(&self, listener: Arc<dyn JobListener>) {
        self.listeners.lock().push(listener);
    }

    /// Remove a listener by identity. Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn JobListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let target = Arc::as_ptr(listener) as *const ();
        match listeners
            .iter()
            .position(|l| Arc::as_ptr(l) as *const () == target)
        {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Channels currently executing a bundle of this job.
    pub fn channels_for_job(&self, uuid: &str) -> Vec<ChannelInfo> {
        self.dispatches
            .lock()
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn event(
        &self,
        kind: JobEventKind,
        job: JobInfo,
        channel: Option<ChannelInfo>,
        task_count: Option<usize>,
    ) -> JobEvent {
        JobEvent {
            emitter: self.emitter,
            kind,
            job,
            channel,
            task_count,
            timestamp: Utc::now(),
        }
    }

    pub fn notify(&self, event: JobEvent) {
        self.track_dispatch(&event);

        let listeners: Vec<Arc<dyn JobListener>> = self.listeners.lock().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if result.is_err() {
                tracing::warn!(
                    job_id = %event.job.uuid,
                    kind = %event.kind,
                    "Job listener panicked, continuing with remaining listeners"
                );
            }
        }
    }

    fn track_dispatch(&self, event: &JobEvent) {
        let mut dispatches = self.dispatches.lock();
        match (event.kind, &event.channel) {
            (JobEventKind::Dispatched, Some(channel)) => {
                dispatches
                    .entry(event.job.uuid.clone())
                    .or_default()
                    .push(channel.clone());
            }
            (JobEventKind::Returned, Some(channel)) => {
                if let Some(channels) = dispatches.get_mut(&event.job.uuid) {
                    if let Some(idx) = channels.iter().position(|c| c.id == channel.id) {
                        channels.remove(idx);
                    }
                    if channels.is_empty() {
                        dispatches.remove(&event.job.uuid);
                    }
                }
            }
            (JobEventKind::Ended, _) => {
                dispatches.remove(&event.job.uuid);
            }
            _ => {}
        }
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::scheduler::channel::ChannelInfo;

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One task of a job, identified by its position in the submitted task list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTask {
    pub position: usize,
    pub payload: Vec<u8>,
}

impl ServerTask {
    pub fn new(position: usize, payload: Vec<u8>) -> Self {
        Self { position, payload }
    }

    /// Number the payloads in submission order.
    pub fn from_payloads(payloads: Vec<Vec<u8>>) -> Vec<ServerTask> {
        payloads
            .into_iter()
            .enumerate()
            .map(|(position, payload)| ServerTask::new(position, payload))
            .collect()
    }
}

/// How a dispatched bundle came back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleOutcome {
    /// Every task produced a result
    Completed,
    /// The channel reported an error; the tasks are finished with that error
    Failed(String),
    /// The tasks were not executed and must be dispatched again
    Resubmit,
}

/// A fragment of a job sent to one channel.
///
/// The bundle names its job by uuid only: once the job leaves the queue, a late bundle has
/// nothing to attach to.
#[derive(Debug, Clone)]
pub struct TaskBundle {
    id: u64,
    job_uuid: String,
    job_name: String,
    channel: ChannelInfo,
    tasks: Vec<ServerTask>,
    dispatched_at: Instant,
}

impl TaskBundle {
    pub(crate) fn new(
        job_uuid: String,
        job_name: String,
        channel: ChannelInfo,
        tasks: Vec<ServerTask>,
    ) -> Self {
        Self {
            id: NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed),
            job_uuid,
            job_name,
            channel,
            tasks,
            dispatched_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_uuid(&self) -> &str {
        &self.job_uuid
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub fn tasks(&self) -> &[ServerTask] {
        &self.tasks
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }

    pub fn into_tasks(self) -> Vec<ServerTask> {
        self.tasks
    }
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::scheduler::bundle::{BundleOutcome, ServerTask, TaskBundle};
use crate::scheduler::channel::ChannelInfo;
use crate::scheduler::notifier::{JobEventKind, JobInfo, JobNotifier};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    New = 0,
    Executing = 1,
    Done = 2,
    Cancelled = 3,
}

impl JobStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobStatus::New,
            1 => JobStatus::Executing,
            2 => JobStatus::Done,
            _ => JobStatus::Cancelled,
        }
    }

    /// DONE or CANCELLED: nothing more is dispatched.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::New => write!(f, "new"),
            JobStatus::Executing => write!(f, "executing"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Service agreement of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSla {
    /// Higher runs first
    pub priority: i32,
    /// Maximum number of channels executing the job at the same time
    pub max_channels: usize,
    pub suspended: bool,
    /// Send every task to every channel instead of splitting them
    pub broadcast: bool,
    /// Cancel the job if it has not ended this long after submission
    pub expiration: Option<Duration>,
}

impl Default for JobSla {
    fn default() -> Self {
        Self {
            priority: 0,
            max_channels: usize::MAX,
            suspended: false,
            broadcast: false,
            expiration: None,
        }
    }
}

impl JobSla {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels.max(1);
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// Callback run once when the job reaches DONE or CANCELLED.
pub type CompletionCallback = Arc<dyn Fn(&ServerJob) + Send + Sync>;

/// A bundle out on a channel. The job keeps the tasks so they can be requeued if the
/// channel is lost.
#[derive(Debug)]
struct Dispatch {
    channel: ChannelInfo,
    tasks: Vec<ServerTask>,
    recalled: bool,
}

#[derive(Debug)]
struct JobState {
    sla: JobSla,
    metadata: HashMap<String, String>,
    pending: bool,
    queue_entry_time: Option<DateTime<Utc>>,
    tasks: VecDeque<ServerTask>,
    dispatches: HashMap<u64, Dispatch>,
    broadcast_targets: HashSet<u64>,
    completed: usize,
    failed: usize,
    total_dispatches: u64,
}

#[derive(Default)]
struct Completion {
    fired: bool,
    callbacks: Vec<CompletionCallback>,
}

/// A submitted job and its lifecycle.
///
/// Status transitions are compare-and-set on an atomic and are only attempted while holding
/// the state lock, so a dispatch can never slip past a concurrent cancel. Events and
/// completion callbacks are always invoked after the lock is released.
pub struct ServerJob {
    uuid: String,
    name: String,
    status: AtomicU8,
    expired: AtomicBool,
    received_time: DateTime<Utc>,
    initial_task_count: usize,
    state: Mutex<JobState>,
    completion: Mutex<Completion>,
    notifier: Option<Arc<JobNotifier>>,
}

impl std::fmt::Debug for ServerJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerJob")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("task_count", &self.task_count())
            .finish()
    }
}

impl ServerJob {
    /// Create a job in status NEW. Fails on an empty uuid or an empty task list.
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        tasks: Vec<ServerTask>,
    ) -> Result<Self> {
        let uuid = uuid.into();
        if uuid.trim().is_empty() {
            return Err(GridError::InvalidJob("job uuid is empty".to_string()));
        }
        if tasks.is_empty() {
            return Err(GridError::InvalidJob(format!("job {} has no task", uuid)));
        }
        let initial_task_count = tasks.len();
        Ok(Self {
            uuid,
            name: name.into(),
            status: AtomicU8::new(JobStatus::New as u8),
            expired: AtomicBool::new(false),
            received_time: Utc::now(),
            initial_task_count,
            state: Mutex::new(JobState {
                sla: JobSla::default(),
                metadata: HashMap::new(),
                pending: false,
                queue_entry_time: None,
                tasks: tasks.into(),
                dispatches: HashMap::new(),
                broadcast_targets: HashSet::new(),
                completed: 0,
                failed: 0,
                total_dispatches: 0,
            }),
            completion: Mutex::new(Completion::default()),
            notifier: None,
        })
    }

    pub fn with_sla(self, sla: JobSla) -> Self {
        self.state.lock().sla = sla;
        self
    }

    pub fn with_metadata(self, metadata: HashMap<String, String>) -> Self {
        self.state.lock().metadata = metadata;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<JobNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// DONE or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Every task came back and the job completed normally.
    pub fn is_done(&self) -> bool {
        self.status() == JobStatus::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == JobStatus::Cancelled
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn received_time(&self) -> DateTime<Utc> {
        self.received_time
    }

    pub fn queue_entry_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().queue_entry_time
    }

    pub(crate) fn set_queue_entry_time(&self, time: DateTime<Utc>) {
        self.state.lock().queue_entry_time = Some(time);
    }

    pub fn sla(&self) -> JobSla {
        self.state.lock().sla.clone()
    }

    pub fn priority(&self) -> i32 {
        self.state.lock().sla.priority
    }

    pub fn max_channels(&self) -> usize {
        self.state.lock().sla.max_channels
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().sla.suspended
    }

    pub fn is_broadcast(&self) -> bool {
        self.state.lock().sla.broadcast
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.state.lock().metadata.clone()
    }

    /// Tasks not yet dispatched.
    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn initial_task_count(&self) -> usize {
        self.initial_task_count
    }

    pub fn completed_task_count(&self) -> usize {
        self.state.lock().completed
    }

    pub fn failed_task_count(&self) -> usize {
        self.state.lock().failed
    }

    /// Tasks currently out on channels.
    pub fn in_flight_task_count(&self) -> usize {
        self.state
            .lock()
            .dispatches
            .values()
            .map(|d| d.tasks.len())
            .sum()
    }

    /// Distinct channels currently holding a bundle of this job.
    pub fn in_flight_channels(&self) -> Vec<u64> {
        let state = self.state.lock();
        let mut channels: Vec<u64> = state.dispatches.values().map(|d| d.channel.id).collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    pub fn total_dispatches(&self) -> u64 {
        self.state.lock().total_dispatches
    }

    /// Whether a dispatch to this channel could currently succeed.
    pub fn is_eligible_for(&self, channel_id: u64) -> bool {
        if self.is_terminal() || self.is_expired() {
            return false;
        }
        let state = self.state.lock();
        Self::eligible(&state, channel_id)
    }

    fn eligible(state: &JobState, channel_id: u64) -> bool {
        if state.sla.suspended || state.pending {
            return false;
        }
        if state.sla.broadcast {
            return !state.broadcast_targets.contains(&channel_id);
        }
        if state.tasks.is_empty() {
            return false;
        }
        let already_there = state
            .dispatches
            .values()
            .any(|d| d.channel.id == channel_id);
        if already_there {
            return true;
        }
        let distinct: HashSet<u64> = state.dispatches.values().map(|d| d.channel.id).collect();
        distinct.len() < state.sla.max_channels
    }

    pub fn info(&self) -> JobInfo {
        let state = self.state.lock();
        JobInfo {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            task_count: state.tasks.len(),
            initial_task_count: self.initial_task_count,
            priority: state.sla.priority,
            max_channels: state.sla.max_channels,
            suspended: state.sla.suspended,
            pending: state.pending,
        }
    }

    fn fire(&self, kind: JobEventKind, channel: Option<&ChannelInfo>, task_count: Option<usize>) {
        if let Some(notifier) = &self.notifier {
            let event = notifier.event(kind, self.info(), channel.cloned(), task_count);
            notifier.notify(event);
        }
    }

    pub(crate) fn fire_queued(&self) {
        self.fire(JobEventKind::Queued, None, None);
    }

    fn fire_updated(&self) {
        self.fire(JobEventKind::Updated, None, None);
    }

    fn transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ------------------------------------------------------------------------
    // Dispatch and return
    // ------------------------------------------------------------------------

    /// Carve up to `max_tasks` tasks into a bundle for `channel`.
    ///
    /// Broadcast jobs ignore `max_tasks` and send every task, once per channel. The first
    /// successful dispatch moves the job from NEW to EXECUTING.
    pub fn dispatch(&self, max_tasks: usize, channel: &ChannelInfo) -> Option<TaskBundle> {
        if max_tasks == 0 || self.is_expired() {
            return None;
        }
        let bundle = {
            let mut state = self.state.lock();
            if self.is_terminal() || !Self::eligible(&state, channel.id) {
                return None;
            }

            let tasks: Vec<ServerTask> = if state.sla.broadcast {
                state.broadcast_targets.insert(channel.id);
                state.tasks.iter().cloned().collect()
            } else {
                let count = max_tasks.min(state.tasks.len());
                state.tasks.drain(..count).collect()
            };

            if self.status() == JobStatus::New {
                self.transition(JobStatus::New, JobStatus::Executing);
            }

            let bundle = TaskBundle::new(
                self.uuid.clone(),
                self.name.clone(),
                channel.clone(),
                tasks.clone(),
            );
            state.dispatches.insert(
                bundle.id(),
                Dispatch {
                    channel: channel.clone(),
                    tasks,
                    recalled: false,
                },
            );
            state.total_dispatches += 1;
            bundle
        };

        tracing::debug!(
            job_id = %self.uuid,
            bundle_id = bundle.id(),
            channel = %channel,
            tasks = bundle.task_count(),
            "Bundle dispatched"
        );
        self.fire(
            JobEventKind::Dispatched,
            Some(channel),
            Some(bundle.task_count()),
        );
        self.fire_updated();
        Some(bundle)
    }

    /// Record the return of a bundle. Returns false if the bundle is unknown to this job
    /// (already returned, or never dispatched by it).
    ///
    /// Tasks coming back for a cancelled or expired job are discarded. `Resubmit` puts the
    /// tasks back at the head of the job, as does any return of a bundle recalled by a
    /// suspension with requeue.
    pub fn bundle_returned(&self, bundle_id: u64, outcome: BundleOutcome) -> bool {
        let (channel, became_done) = {
            let mut state = self.state.lock();
            let dispatch = match state.dispatches.remove(&bundle_id) {
                Some(d) => d,
                None => {
                    tracing::debug!(job_id = %self.uuid, bundle_id, "Unknown bundle returned");
                    return false;
                }
            };
            let count = dispatch.tasks.len();

            if self.is_terminal() || self.is_expired() {
                tracing::debug!(job_id = %self.uuid, bundle_id, tasks = count, "Discarding tasks of ended job");
            } else if state.sla.broadcast {
                match &outcome {
                    BundleOutcome::Completed => state.completed += count,
                    BundleOutcome::Failed(_) => state.failed += count,
                    // channel can be targeted again
                    BundleOutcome::Resubmit => {
                        state.broadcast_targets.remove(&dispatch.channel.id);
                    }
                }
            } else if dispatch.recalled || outcome == BundleOutcome::Resubmit {
                for task in dispatch.tasks.into_iter().rev() {
                    state.tasks.push_front(task);
                }
            } else {
                match &outcome {
                    BundleOutcome::Completed => state.completed += count,
                    BundleOutcome::Failed(message) => {
                        tracing::warn!(job_id = %self.uuid, bundle_id, tasks = count, error = %message, "Bundle failed");
                        state.failed += count;
                    }
                    BundleOutcome::Resubmit => {}
                }
            }

            let became_done = !state.sla.broadcast
                && state.tasks.is_empty()
                && state.dispatches.is_empty()
                && self.transition(JobStatus::Executing, JobStatus::Done);
            (dispatch.channel, became_done)
        };

        let remaining = self.task_count();
        self.fire(JobEventKind::Returned, Some(&channel), Some(remaining));

        if became_done {
            tracing::info!(job_id = %self.uuid, name = %self.name, "Job done");
            self.finish();
        }
        true
    }

    /// End a broadcast job once every channel in `channels` has received and returned it.
    pub fn complete_broadcast(&self, channels: &[u64]) -> bool {
        let became_done = {
            let state = self.state.lock();
            state.sla.broadcast
                && state.dispatches.is_empty()
                && !state.broadcast_targets.is_empty()
                && channels
                    .iter()
                    .all(|id| state.broadcast_targets.contains(id))
                && self.transition(JobStatus::Executing, JobStatus::Done)
        };
        if became_done {
            tracing::info!(job_id = %self.uuid, name = %self.name, "Broadcast job done");
            self.finish();
        }
        became_done
    }

    // ------------------------------------------------------------------------
    // Administrative actions
    // ------------------------------------------------------------------------

    /// Cancel the job. Returns false if it already ended.
    ///
    /// Does not wait for bundles in flight; their tasks are discarded when they return.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.cancel_with(may_interrupt, false)
    }

    fn cancel_with(&self, may_interrupt: bool, expired: bool) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            let cancelled = self.transition(JobStatus::New, JobStatus::Cancelled)
                || self.transition(JobStatus::Executing, JobStatus::Cancelled);
            if cancelled {
                if expired {
                    self.expired.store(true, Ordering::Release);
                }
                state.tasks.clear();
            }
            cancelled
        };
        if !cancelled {
            return false;
        }
        tracing::info!(
            job_id = %self.uuid,
            name = %self.name,
            may_interrupt,
            expired = self.is_expired(),
            "Job cancelled"
        );
        self.finish();
        true
    }

    /// Cancel the job because its expiration passed. Returns true if this call cancelled it;
    /// a job that already ended is left as it is and does not count as expired.
    pub fn job_expired(&self) -> bool {
        self.cancel_with(false, true)
    }

    /// Suspend or resume the job. With `requeue`, bundles currently out are recalled: their
    /// tasks go back to the job whatever the outcome reported by the channel.
    pub fn set_suspended(&self, suspended: bool, requeue: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.sla.suspended == suspended {
                return false;
            }
            state.sla.suspended = suspended;
            if suspended && requeue {
                for dispatch in state.dispatches.values_mut() {
                    dispatch.recalled = true;
                }
            }
        }
        tracing::info!(job_id = %self.uuid, suspended, requeue, "Job suspension changed");
        self.fire_updated();
        true
    }

    /// Change the channel limit. Zero is ignored.
    pub fn set_max_channels(&self, max_channels: usize) -> bool {
        if max_channels == 0 {
            return false;
        }
        {
            let mut state = self.state.lock();
            if state.sla.max_channels == max_channels {
                return false;
            }
            state.sla.max_channels = max_channels;
        }
        self.fire_updated();
        true
    }

    pub fn set_priority(&self, priority: i32) -> bool {
        {
            let mut state = self.state.lock();
            if state.sla.priority == priority {
                return false;
            }
            state.sla.priority = priority;
        }
        self.fire_updated();
        true
    }

    pub fn set_pending(&self, pending: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.pending == pending {
                return false;
            }
            state.pending = pending;
        }
        self.fire_updated();
        true
    }

    /// Replace the SLA and/or the metadata. Fires a single UPDATED event.
    pub fn update(&self, sla: Option<JobSla>, metadata: Option<HashMap<String, String>>) -> bool {
        if sla.is_none() && metadata.is_none() {
            return false;
        }
        {
            let mut state = self.state.lock();
            if let Some(sla) = sla {
                state.sla = sla;
            }
            if let Some(metadata) = metadata {
                state.metadata = metadata;
            }
        }
        self.fire_updated();
        true
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Register a completion callback. If the job already ended, it runs immediately on the
    /// calling thread.
    pub fn add_on_completion(&self, callback: CompletionCallback) {
        {
            let mut completion = self.completion.lock();
            if !completion.fired {
                completion.callbacks.push(callback);
                return;
            }
        }
        self.run_callback(&callback);
    }

    /// Remove the first registration of `callback`. Returns false if it was not registered.
    pub fn remove_on_completion(&self, callback: &CompletionCallback) -> bool {
        let mut completion = self.completion.lock();
        let target = Arc::as_ptr(callback) as *const ();
        match completion
            .callbacks
            .iter()
            .position(|c| Arc::as_ptr(c) as *const () == target)
        {
            Some(idx) => {
                completion.callbacks.remove(idx);
                true
            }
            None => false,
        }
    }

    fn finish(&self) {
        let callbacks = {
            let mut completion = self.completion.lock();
            if completion.fired {
                return;
            }
            completion.fired = true;
            std::mem::take(&mut completion.callbacks)
        };
        self.fire(JobEventKind::Ended, None, None);
        for callback in &callbacks {
            self.run_callback(callback);
        }
    }

    fn run_callback(&self, callback: &CompletionCallback) {
        if catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
            tracing::warn!(job_id = %self.uuid, "Job completion callback panicked");
        }
    }
}

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::error::{GridError, Result};
use crate::scheduler::job::ServerJob;
use crate::scheduler::notifier::JobNotifier;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Owns the submitted jobs, keyed by uuid.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<String, Arc<ServerJob>>,
    max_jobs: usize,
    notifier: Arc<JobNotifier>,
    latest_max_bundle_size: AtomicUsize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(Arc::new(JobNotifier::new()))
    }
}

impl JobQueue {
    pub fn new(notifier: Arc<JobNotifier>) -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS, notifier)
    }

    pub fn with_capacity(max_jobs: usize, notifier: Arc<JobNotifier>) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
            notifier,
            latest_max_bundle_size: AtomicUsize::new(0),
        }
    }

    pub fn notifier(&self) -> &Arc<JobNotifier> {
        &self.notifier
    }

    /// Take ownership of a job, stamp its queue entry time and fire QUEUED.
    pub fn add_job(&mut self, job: ServerJob) -> Result<Arc<ServerJob>> {
        if self.jobs.len() >= self.max_jobs {
            return Err(GridError::QueueFull(self.max_jobs));
        }
        if self.jobs.contains_key(job.uuid()) {
            return Err(GridError::InvalidJob(format!(
                "job {} is already queued",
                job.uuid()
            )));
        }
        let job = Arc::new(job.with_notifier(self.notifier.clone()));
        job.set_queue_entry_time(Utc::now());
        self.jobs.insert(job.uuid().to_string(), job.clone());

        tracing::info!(
            job_id = %job.uuid(),
            name = %job.name(),
            tasks = job.initial_task_count(),
            priority = job.priority(),
            "Job queued"
        );
        job.fire_queued();
        Ok(job)
    }

    pub fn get_job(&self, uuid: &str) -> Option<Arc<ServerJob>> {
        self.jobs.get(uuid).cloned()
    }

    pub fn remove_job(&mut self, uuid: &str) -> Option<Arc<ServerJob>> {
        self.jobs.remove(uuid)
    }

    fn lookup(&self, uuid: &str) -> Result<&Arc<ServerJob>> {
        self.jobs
            .get(uuid)
            .ok_or_else(|| GridError::JobNotFound(uuid.to_string()))
    }

    pub fn cancel_job(&self, uuid: &str) -> Result<bool> {
        Ok(self.lookup(uuid)?.cancel(true))
    }

    pub fn suspend_job(&self, uuid: &str, suspended: bool, requeue: bool) -> Result<bool> {
        Ok(self.lookup(uuid)?.set_suspended(suspended, requeue))
    }

    pub fn set_max_channels(&self, uuid: &str, max_channels: usize) -> Result<bool> {
        Ok(self.lookup(uuid)?.set_max_channels(max_channels))
    }

    pub fn set_priority(&self, uuid: &str, priority: i32) -> Result<bool> {
        Ok(self.lookup(uuid)?.set_priority(priority))
    }

    /// Jobs not yet ended, highest priority first, then oldest first.
    pub fn jobs_by_priority(&self) -> Vec<Arc<ServerJob>> {
        let mut jobs: Vec<Arc<ServerJob>> = self
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| {
            (
                Reverse(j.priority()),
                j.queue_entry_time(),
                j.uuid().to_string(),
            )
        });
        jobs
    }

    /// Jobs a dispatch to `channel_id` could draw from, in dispatch order.
    pub fn eligible_jobs(&self, channel_id: u64) -> Vec<Arc<ServerJob>> {
        self.jobs_by_priority()
            .into_iter()
            .filter(|j| j.is_eligible_for(channel_id))
            .collect()
    }

    /// All jobs sorted chronologically by queue entry time
    pub fn all_jobs(&self) -> Vec<Arc<ServerJob>> {
        let mut jobs: Vec<Arc<ServerJob>> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.queue_entry_time(), j.uuid().to_string()));
        jobs
    }

    /// Largest number of undispatched tasks among live jobs. When no job has tasks left,
    /// the last non-zero value is kept.
    pub fn max_bundle_size(&self) -> usize {
        let current = self
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .map(|j| j.task_count())
            .max()
            .unwrap_or(0);
        if current > 0 {
            self.latest_max_bundle_size.store(current, Ordering::Relaxed);
            current
        } else {
            self.latest_max_bundle_size.load(Ordering::Relaxed)
        }
    }

    /// True when every job has ended.
    pub fn all_terminal(&self) -> bool {
        self.jobs.values().all(|j| j.is_terminal())
    }

    /// Remove ended jobs with no bundle left in flight. Returns the number removed.
    pub fn cleanup_finished_jobs(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.is_terminal() && job.in_flight_task_count() == 0));
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::bundler::{Bundler, BundlerFactory};
use crate::config::GridConfig;
use crate::scheduler::bundle::{BundleOutcome, TaskBundle};
use crate::scheduler::channel::ChannelInfo;
use crate::scheduler::queue::JobQueue;

/// A bundle out on a channel.
#[derive(Debug, Clone)]
struct InFlight {
    job_uuid: String,
    task_count: usize,
}

/// Channel state tracking
#[derive(Debug)]
pub struct ChannelState {
    pub info: ChannelInfo,
    pub last_heartbeat: Instant,
    pub dispatched_bundles: u64,
    bundler: Box<dyn Bundler>,
    in_flight: HashMap<u64, InFlight>,
}

impl ChannelState {
    fn new(info: ChannelInfo, bundler: Box<dyn Bundler>) -> Self {
        Self {
            info,
            last_heartbeat: Instant::now(),
            dispatched_bundles: 0,
            bundler,
            in_flight: HashMap::new(),
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        self.last_heartbeat.elapsed().as_millis() < timeout_ms as u128
    }

    /// A channel executes one bundle at a time.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn bundler(&self) -> &dyn Bundler {
        self.bundler.as_ref()
    }

    pub fn bundle_size(&self) -> usize {
        self.bundler.bundle_size()
    }

    pub fn in_flight_bundles(&self) -> Vec<u64> {
        self.in_flight.keys().copied().collect()
    }
}

/// Pairs idle channels with queued jobs, sized by each channel's bundler, and routes
/// returned bundles back to their jobs and bundlers.
#[derive(Debug)]
pub struct JobDispatcher {
    factory: BundlerFactory,
    channels: BTreeMap<u64, ChannelState>,
    channel_timeout_ms: u64,
}

impl JobDispatcher {
    pub fn new(factory: BundlerFactory, channel_timeout_ms: u64) -> Self {
        Self {
            factory,
            channels: BTreeMap::new(),
            channel_timeout_ms,
        }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        let factory = BundlerFactory::new(&config.load_balancing, config.default_max_bundle_size);
        Self::new(factory, config.channel_timeout_ms)
    }

    pub fn factory(&self) -> &BundlerFactory {
        &self.factory
    }

    /// Attach a channel and give it a bundler. Returns false if the id is already attached.
    pub fn attach_channel(&mut self, info: ChannelInfo) -> bool {
        if self.channels.contains_key(&info.id) {
            return false;
        }
        let bundler = self.factory.new_bundler();
        bundler.setup();
        tracing::info!(
            channel = %info,
            bundler_id = bundler.id(),
            algorithm = bundler.algorithm(),
            initial_size = bundler.bundle_size(),
            "Channel attached"
        );
        self.channels
            .insert(info.id, ChannelState::new(info, bundler));
        true
    }

    /// Detach a channel. Its bundler leaves the family and bundles it still holds are
    /// handed back to their jobs for dispatch elsewhere. Returns the number of requeued
    /// bundles, or `None` for an unknown channel.
    pub fn detach_channel(&mut self, channel_id: u64, queue: &JobQueue) -> Option<usize> {
        let channel = self.channels.remove(&channel_id)?;
        channel.bundler.dispose();

        let mut requeued = 0;
        for (bundle_id, in_flight) in channel.in_flight {
            if let Some(job) = queue.get_job(&in_flight.job_uuid) {
                if job.bundle_returned(bundle_id, BundleOutcome::Resubmit) {
                    requeued += 1;
                }
            }
        }
        tracing::info!(
            channel = %channel.info,
            requeued_bundles = requeued,
            "Channel detached"
        );

        // a broadcast job may now have reached every remaining channel
        let attached = self.channel_ids();
        for job in queue.all_jobs() {
            if job.is_broadcast() && !job.is_terminal() {
                job.complete_broadcast(&attached);
            }
        }
        Some(requeued)
    }

    /// Update channel heartbeat
    pub fn channel_heartbeat(&mut self, channel_id: u64) {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.update_heartbeat();
        } else {
            // Auto-attach on heartbeat
            self.attach_channel(ChannelInfo::node(
                channel_id,
                format!("channel-{}", channel_id),
            ));
        }
    }

    pub fn channel(&self, channel_id: u64) -> Option<&ChannelState> {
        self.channels.get(&channel_id)
    }

    pub fn all_channels(&self) -> Vec<&ChannelState> {
        self.channels.values().collect()
    }

    pub fn channel_ids(&self) -> Vec<u64> {
        self.channels.keys().copied().collect()
    }

    pub fn bundle_size(&self, channel_id: u64) -> Option<usize> {
        self.channels.get(&channel_id).map(|c| c.bundle_size())
    }

    /// Channels that are alive and hold no bundle.
    pub fn available_channels(&self) -> Vec<u64> {
        self.channels
            .values()
            .filter(|c| c.is_alive(self.channel_timeout_ms) && c.is_idle())
            .map(|c| c.info.id)
            .collect()
    }

    pub fn check_dead_channels(&self) -> Vec<u64> {
        self.channels
            .values()
            .filter(|c| !c.is_alive(self.channel_timeout_ms))
            .map(|c| c.info.id)
            .collect()
    }

    /// Dispatch one bundle to an idle channel, if any job can use one.
    pub fn dispatch_next(&mut self, queue: &JobQueue) -> Option<TaskBundle> {
        self.factory.set_max_size(queue.max_bundle_size());

        for channel_id in self.available_channels() {
            let channel = self.channels.get_mut(&channel_id)?;
            let size = channel.bundle_size();
            for job in queue.eligible_jobs(channel_id) {
                if let Some(bundle) = job.dispatch(size, &channel.info) {
                    channel.in_flight.insert(
                        bundle.id(),
                        InFlight {
                            job_uuid: bundle.job_uuid().to_string(),
                            task_count: bundle.task_count(),
                        },
                    );
                    channel.dispatched_bundles += 1;
                    tracing::debug!(
                        channel = %channel.info,
                        job_id = %bundle.job_uuid(),
                        bundle_id = bundle.id(),
                        requested = size,
                        tasks = bundle.task_count(),
                        "Bundle assigned"
                    );
                    return Some(bundle);
                }
            }
        }
        None
    }

    /// Dispatch until no idle channel can be matched with a job.
    pub fn dispatch_all(&mut self, queue: &JobQueue) -> Vec<TaskBundle> {
        let mut bundles = Vec::new();
        while let Some(bundle) = self.dispatch_next(queue) {
            bundles.push(bundle);
        }
        bundles
    }

    /// Route a returned bundle: feed the elapsed time to the channel's bundler, then hand
    /// the outcome to the job. Returns false for an unknown channel or bundle.
    pub fn bundle_returned(
        &mut self,
        channel_id: u64,
        bundle_id: u64,
        outcome: BundleOutcome,
        elapsed: Duration,
        queue: &JobQueue,
    ) -> bool {
        let attached = self.channel_ids();
        let channel = match self.channels.get_mut(&channel_id) {
            Some(c) => c,
            None => {
                tracing::warn!(channel_id, bundle_id, "Bundle returned from unknown channel");
                return false;
            }
        };
        let in_flight = match channel.in_flight.remove(&bundle_id) {
            Some(f) => f,
            None => {
                tracing::warn!(channel = %channel.info, bundle_id, "Unknown bundle returned");
                return false;
            }
        };
        channel.update_heartbeat();

        if outcome != BundleOutcome::Resubmit {
            channel
                .bundler
                .feedback_elapsed(in_flight.task_count, elapsed);
        }

        match queue.get_job(&in_flight.job_uuid) {
            Some(job) => {
                job.bundle_returned(bundle_id, outcome);
                if job.is_broadcast() {
                    job.complete_broadcast(&attached);
                }
            }
            None => {
                tracing::debug!(
                    job_id = %in_flight.job_uuid,
                    bundle_id,
                    "Job no longer queued, dropping returned bundle"
                );
            }
        }
        true
    }
}

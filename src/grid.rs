use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::GridConfig;
use crate::error::{GridError, Result};
use crate::scheduler::{
    BundleOutcome, ChannelInfo, JobDispatcher, JobNotifier, JobQueue, JobSla, ServerJob,
    ServerTask, TaskBundle,
};
use crate::worker::{ExecutionResult, HeartbeatSender, LocalExecutor};

const CHANNEL_BUFFER: usize = 1024;

/// Receiving ends of the grid's internal channels, consumed by [`Grid::run`].
pub struct GridReceivers {
    results: mpsc::Receiver<ExecutionResult>,
    heartbeats: mpsc::Receiver<u64>,
}

/// A local channel's executor and heartbeat loops.
struct LocalChannel {
    bundles: mpsc::Sender<TaskBundle>,
    cancel: CancellationToken,
}

/// Wires the job queue, the dispatcher and the local execution channels together.
pub struct Grid {
    config: GridConfig,
    notifier: Arc<JobNotifier>,
    job_queue: Arc<RwLock<JobQueue>>,
    dispatcher: Arc<RwLock<JobDispatcher>>,
    channels: RwLock<HashMap<u64, LocalChannel>>,
    results_tx: mpsc::Sender<ExecutionResult>,
    heartbeat_tx: mpsc::Sender<u64>,
    next_channel_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Grid {
    pub fn new(config: GridConfig, shutdown: CancellationToken) -> (Self, GridReceivers) {
        let notifier = Arc::new(JobNotifier::new());
        let job_queue = JobQueue::with_capacity(config.max_jobs, notifier.clone());
        let dispatcher = JobDispatcher::from_config(&config);
        let (results_tx, results) = mpsc::channel(CHANNEL_BUFFER);
        let (heartbeat_tx, heartbeats) = mpsc::channel(CHANNEL_BUFFER);

        let grid = Self {
            config,
            notifier,
            job_queue: Arc::new(RwLock::new(job_queue)),
            dispatcher: Arc::new(RwLock::new(dispatcher)),
            channels: RwLock::new(HashMap::new()),
            results_tx,
            heartbeat_tx,
            next_channel_id: AtomicU64::new(1),
            shutdown,
        };
        (grid, GridReceivers { results, heartbeats })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<JobNotifier> {
        &self.notifier
    }

    pub fn job_queue(&self) -> &Arc<RwLock<JobQueue>> {
        &self.job_queue
    }

    pub fn dispatcher(&self) -> &Arc<RwLock<JobDispatcher>> {
        &self.dispatcher
    }

    /// Submit a job made of one task per payload. A job whose SLA carries an expiration
    /// is cancelled if it has not ended that long after submission.
    ///
    /// Ended jobs leave the queue periodically, and at once when it is full; keep the
    /// returned handle to follow a job to its end.
    pub async fn submit_job(
        &self,
        name: impl Into<String>,
        payloads: Vec<Vec<u8>>,
        sla: JobSla,
    ) -> Result<Arc<ServerJob>> {
        let expiration = sla.expiration;
        let job = ServerJob::new(
            Uuid::new_v4().to_string(),
            name,
            ServerTask::from_payloads(payloads),
        )?
        .with_sla(sla);
        let job = {
            let mut queue = self.job_queue.write().await;
            if queue.is_full() {
                Self::remove_finished_jobs(&mut queue);
            }
            queue.add_job(job)?
        };

        if let Some(expiration) = expiration {
            let weak = Arc::downgrade(&job);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(expiration) => {
                        if let Some(job) = weak.upgrade() {
                            if job.job_expired() {
                                tracing::info!(job_id = %job.uuid(), "Job expired");
                            }
                        }
                    }
                }
            });
        }
        Ok(job)
    }

    pub async fn job(&self, uuid: &str) -> Option<Arc<ServerJob>> {
        self.job_queue.read().await.get_job(uuid)
    }

    pub async fn cancel_job(&self, uuid: &str) -> Result<bool> {
        self.job_queue.read().await.cancel_job(uuid)
    }

    /// True when every submitted job has ended.
    pub async fn all_terminal(&self) -> bool {
        self.job_queue.read().await.all_terminal()
    }

    /// Current bundle size of each attached channel.
    pub async fn bundle_sizes(&self) -> Vec<(u64, usize)> {
        let dispatcher = self.dispatcher.read().await;
        dispatcher
            .all_channels()
            .iter()
            .map(|c| (c.info.id, c.bundle_size()))
            .collect()
    }

    /// Attach an in-process channel executing at `speed` relative to the configured task
    /// cost, and start its executor and heartbeat loops.
    pub async fn attach_local_channel(&self, speed: f64) -> ChannelInfo {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let info = ChannelInfo::local(id);
        let cancel = self.shutdown.child_token();
        let (bundles_tx, bundles_rx) = mpsc::channel(CHANNEL_BUFFER);

        let executor = LocalExecutor::new(info.clone(), speed, self.config.executor.clone());
        tokio::spawn(Self::executor_loop(
            executor,
            bundles_rx,
            self.results_tx.clone(),
            cancel.clone(),
        ));

        let heartbeat = HeartbeatSender::new(id, self.config.executor.heartbeat_interval_ms);
        let heartbeat_tx = self.heartbeat_tx.clone();
        let heartbeat_cancel = cancel.clone();
        tokio::spawn(async move {
            heartbeat.run(heartbeat_tx, heartbeat_cancel).await;
        });

        self.channels.write().await.insert(
            id,
            LocalChannel {
                bundles: bundles_tx,
                cancel,
            },
        );
        self.dispatcher.write().await.attach_channel(info.clone());
        info
    }

    /// Detach a channel; bundles it still holds go back to their jobs.
    pub async fn detach_channel(&self, channel_id: u64) -> Result<usize> {
        if let Some(channel) = self.channels.write().await.remove(&channel_id) {
            channel.cancel.cancel();
        }
        let queue = self.job_queue.read().await;
        let mut dispatcher = self.dispatcher.write().await;
        dispatcher
            .detach_channel(channel_id, &queue)
            .ok_or(GridError::ChannelNotFound(channel_id))
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(&self, receivers: GridReceivers) {
        let GridReceivers {
            mut results,
            mut heartbeats,
        } = receivers;
        let mut dispatch_interval = tokio::time::interval(Duration::from_millis(
            self.config.dispatch_interval_ms.max(1),
        ));
        let liveness_period = Duration::from_millis((self.config.channel_timeout_ms / 2).max(1));
        let mut liveness_interval = tokio::time::interval_at(
            tokio::time::Instant::now() + liveness_period,
            liveness_period,
        );

        let algorithm = self.dispatcher.read().await.factory().algorithm();
        tracing::info!(algorithm, "Grid started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Grid shutting down");
                    break;
                }
                Some(result) = results.recv() => {
                    self.handle_result(result).await;
                    self.dispatch().await;
                }
                Some(channel_id) = heartbeats.recv() => {
                    // heartbeats of a channel detached meanwhile are dropped
                    if self.channels.read().await.contains_key(&channel_id) {
                        self.dispatcher.write().await.channel_heartbeat(channel_id);
                    }
                }
                _ = dispatch_interval.tick() => {
                    self.dispatch().await;
                }
                _ = liveness_interval.tick() => {
                    self.detach_dead_channels().await;
                    Self::remove_finished_jobs(&mut *self.job_queue.write().await);
                }
            }
        }

        for channel in self.channels.write().await.drain().map(|(_, c)| c) {
            channel.cancel.cancel();
        }
    }

    async fn dispatch(&self) {
        let bundles = {
            let queue = self.job_queue.read().await;
            let mut dispatcher = self.dispatcher.write().await;
            dispatcher.dispatch_all(&queue)
        };

        for bundle in bundles {
            let channel_id = bundle.channel().id;
            let sender = self
                .channels
                .read()
                .await
                .get(&channel_id)
                .map(|c| c.bundles.clone());
            let undelivered = match sender {
                Some(tx) => tx.send(bundle).await.err().map(|e| e.0),
                None => Some(bundle),
            };
            if let Some(bundle) = undelivered {
                tracing::warn!(
                    channel_id,
                    bundle_id = bundle.id(),
                    "Channel gone, requeueing bundle"
                );
                let queue = self.job_queue.read().await;
                let mut dispatcher = self.dispatcher.write().await;
                dispatcher.bundle_returned(
                    channel_id,
                    bundle.id(),
                    BundleOutcome::Resubmit,
                    Duration::ZERO,
                    &queue,
                );
            }
        }
    }

    async fn handle_result(&self, result: ExecutionResult) {
        let queue = self.job_queue.read().await;
        let mut dispatcher = self.dispatcher.write().await;
        dispatcher.bundle_returned(
            result.channel_id,
            result.bundle_id,
            result.outcome,
            result.elapsed,
            &queue,
        );
    }

    fn remove_finished_jobs(queue: &mut JobQueue) {
        let removed = queue.cleanup_finished_jobs();
        if removed > 0 {
            tracing::debug!(removed, remaining = queue.len(), "Finished jobs removed");
        }
    }

    async fn detach_dead_channels(&self) {
        let dead = self.dispatcher.read().await.check_dead_channels();
        for channel_id in dead {
            tracing::warn!(channel_id, "Channel missed its heartbeats, detaching");
            if let Err(e) = self.detach_channel(channel_id).await {
                tracing::debug!(channel_id, error = %e, "Dead channel already detached");
            }
        }
    }

    async fn executor_loop(
        executor: LocalExecutor,
        mut bundles: mpsc::Receiver<TaskBundle>,
        results: mpsc::Sender<ExecutionResult>,
        cancel: CancellationToken,
    ) {
        loop {
            let bundle = tokio::select! {
                _ = cancel.cancelled() => break,
                bundle = bundles.recv() => match bundle {
                    Some(bundle) => bundle,
                    None => break,
                },
            };
            let result = executor.execute(&bundle).await;
            if results.send(result).await.is_err() {
                break;
            }
        }
        tracing::debug!(channel = %executor.channel(), "Executor stopped");
    }
}

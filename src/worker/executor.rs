use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::ExecutorConfig;
use crate::scheduler::{BundleOutcome, ChannelInfo, TaskBundle};

/// Result of executing one bundle
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub bundle_id: u64,
    pub channel_id: u64,
    pub job_uuid: String,
    pub task_count: usize,
    pub outcome: BundleOutcome,
    pub elapsed: Duration,
}

/// An in-process execution channel.
///
/// Tasks are not interpreted: a bundle takes `task_cost_us / speed` per task, varied by the
/// configured jitter, so channels of different speeds produce the timing spread the
/// load balancer adapts to.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    channel: ChannelInfo,
    speed: f64,
    config: ExecutorConfig,
}

impl LocalExecutor {
    pub fn new(channel: ChannelInfo, speed: f64, config: ExecutorConfig) -> Self {
        let speed = if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            tracing::warn!(channel = %channel, speed, "Invalid channel speed, using 1.0");
            1.0
        };
        Self {
            channel,
            speed,
            config,
        }
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Duration of a bundle of `task_count` tasks, before jitter.
    pub fn expected_duration(&self, task_count: usize) -> Duration {
        let micros = task_count as f64 * self.config.task_cost_us as f64 / self.speed;
        Duration::from_nanos((micros * 1000.0).round() as u64)
    }

    pub async fn execute(&self, bundle: &TaskBundle) -> ExecutionResult {
        let task_count = bundle.task_count();
        let factor = if self.config.jitter.is_finite() && self.config.jitter > 0.0 {
            let jitter = self.config.jitter.min(0.99);
            1.0 + rand::thread_rng().gen_range(-jitter..jitter)
        } else {
            1.0
        };
        let cost = self.expected_duration(task_count).mul_f64(factor);

        tracing::debug!(
            channel = %self.channel,
            bundle_id = bundle.id(),
            job_id = %bundle.job_uuid(),
            tasks = task_count,
            "Executing bundle"
        );

        let start = Instant::now();
        tokio::time::sleep(cost).await;
        let elapsed = start.elapsed();

        tracing::debug!(
            channel = %self.channel,
            bundle_id = bundle.id(),
            elapsed_us = elapsed.as_micros() as u64,
            "Bundle executed"
        );

        ExecutionResult {
            bundle_id: bundle.id(),
            channel_id: self.channel.id,
            job_uuid: bundle.job_uuid().to_string(),
            task_count,
            outcome: BundleOutcome::Completed,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_duration_scales_with_speed() {
        let config = ExecutorConfig::default().with_task_cost_us(1000);
        let slow = LocalExecutor::new(ChannelInfo::local(1), 1.0, config.clone());
        let fast = LocalExecutor::new(ChannelInfo::local(2), 4.0, config);

        assert_eq!(slow.expected_duration(10), Duration::from_millis(10));
        assert_eq!(fast.expected_duration(10), Duration::from_micros(2500));
    }

    #[test]
    fn invalid_speed_defaults_to_one() {
        let exec = LocalExecutor::new(ChannelInfo::local(1), -2.0, ExecutorConfig::default());
        assert_eq!(exec.speed(), 1.0);
        let exec = LocalExecutor::new(ChannelInfo::local(1), f64::NAN, ExecutorConfig::default());
        assert_eq!(exec.speed(), 1.0);
    }

    #[tokio::test]
    async fn execute_reports_completed_bundle() {
        use crate::scheduler::ServerTask;

        let channel = ChannelInfo::local(3);
        let config = ExecutorConfig::default().with_task_cost_us(100).with_jitter(0.0);
        let exec = LocalExecutor::new(channel.clone(), 2.0, config);
        let bundle = TaskBundle::new(
            "job-1".to_string(),
            "job".to_string(),
            channel,
            ServerTask::from_payloads(vec![vec![1], vec![2], vec![3], vec![4]]),
        );

        let result = exec.execute(&bundle).await;
        assert_eq!(result.bundle_id, bundle.id());
        assert_eq!(result.channel_id, 3);
        assert_eq!(result.job_uuid, "job-1");
        assert_eq!(result.task_count, 4);
        assert_eq!(result.outcome, BundleOutcome::Completed);
        assert!(result.elapsed >= Duration::from_micros(200));
    }
}

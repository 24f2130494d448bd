use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use taskgrid::config::{ExecutorConfig, GridConfig, LoadBalancingConfig};
use taskgrid::grid::Grid;
use taskgrid::scheduler::{JobEvent, JobEventKind, JobSla, JobStatus};
use taskgrid::GridError;

fn fast_config() -> GridConfig {
    GridConfig {
        dispatch_interval_ms: 5,
        ..GridConfig::default()
    }
    .with_executor(
        ExecutorConfig {
            heartbeat_interval_ms: 50,
            ..ExecutorConfig::default()
        }
        .with_task_cost_us(50)
        .with_jitter(0.0),
    )
}

fn payloads(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| (i as u32).to_le_bytes().to_vec()).collect()
}

/// Start a grid's run loop in the background.
fn start(config: GridConfig) -> (Arc<Grid>, CancellationToken, tokio::task::JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let (grid, receivers) = Grid::new(config, shutdown.clone());
    let grid = Arc::new(grid);
    let runner = {
        let grid = grid.clone();
        tokio::spawn(async move { grid.run(receivers).await })
    };
    (grid, shutdown, runner)
}

async fn wait_all_terminal(grid: &Grid) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !grid.all_terminal().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("jobs did not finish in time");
}

#[tokio::test]
async fn test_jobs_complete_on_local_channels() {
    let (grid, shutdown, runner) = start(fast_config());
    let ended = Arc::new(AtomicUsize::new(0));
    let seen = ended.clone();
    grid.notifier().add_listener(Arc::new(move |event: &JobEvent| {
        if event.kind == JobEventKind::Ended {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    }));

    grid.attach_local_channel(1.0).await;
    grid.attach_local_channel(4.0).await;

    let first = grid
        .submit_job("first", payloads(150), JobSla::default())
        .await
        .unwrap();
    let second = grid
        .submit_job("second", payloads(80), JobSla::default().with_priority(3))
        .await
        .unwrap();

    wait_all_terminal(&grid).await;

    assert_eq!(first.status(), JobStatus::Done);
    assert_eq!(first.completed_task_count(), 150);
    assert_eq!(second.status(), JobStatus::Done);
    assert_eq!(second.completed_task_count(), 80);
    assert_eq!(ended.load(Ordering::SeqCst), 2);

    let sizes = grid.bundle_sizes().await;
    assert_eq!(sizes.len(), 2);
    assert!(sizes.iter().all(|(_, size)| *size >= 1));

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_manual_algorithm_dispatches_fixed_bundles() {
    let config = fast_config()
        .with_load_balancing(LoadBalancingConfig::new("manual").with_parameter("size", 5));
    let (grid, shutdown, runner) = start(config);
    grid.attach_local_channel(2.0).await;

    let job = grid
        .submit_job("fixed", payloads(20), JobSla::default())
        .await
        .unwrap();
    wait_all_terminal(&grid).await;

    assert!(job.is_done());
    assert_eq!(job.total_dispatches(), 4);
    assert_eq!(grid.bundle_sizes().await[0].1, 5);

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_job_expires_without_channels() {
    let (grid, shutdown, runner) = start(fast_config());

    let job = grid
        .submit_job(
            "stale",
            payloads(3),
            JobSla::default().with_expiration(Duration::from_millis(30)),
        )
        .await
        .unwrap();
    wait_all_terminal(&grid).await;

    assert!(job.is_expired());
    assert_eq!(job.status(), JobStatus::Cancelled);

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_cancel_job_through_grid() {
    let (grid, shutdown, runner) = start(fast_config());
    let job = grid
        .submit_job("idle", payloads(5), JobSla::default().suspended())
        .await
        .unwrap();

    assert!(grid.cancel_job(job.uuid()).await.unwrap());
    assert!(!grid.cancel_job(job.uuid()).await.unwrap());
    assert!(matches!(
        grid.cancel_job("unknown").await,
        Err(GridError::JobNotFound(_))
    ));
    assert!(grid.job(job.uuid()).await.unwrap().is_cancelled());

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_detach_local_channel() {
    let (grid, shutdown, runner) = start(fast_config());
    let channel = grid.attach_local_channel(1.0).await;
    assert_eq!(grid.bundle_sizes().await.len(), 1);

    assert_eq!(grid.detach_channel(channel.id).await.unwrap(), 0);
    assert!(matches!(
        grid.detach_channel(channel.id).await,
        Err(GridError::ChannelNotFound(_))
    ));
    assert!(grid.bundle_sizes().await.is_empty());

    // heartbeats of the detached channel must not bring it back
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(grid.bundle_sizes().await.is_empty());

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_invalid_submission() {
    let (grid, shutdown, runner) = start(fast_config());
    assert!(matches!(
        grid.submit_job("empty", Vec::new(), JobSla::default()).await,
        Err(GridError::InvalidJob(_))
    ));

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_finished_jobs_leave_the_queue() {
    let config = GridConfig {
        max_jobs: 2,
        channel_timeout_ms: 200,
        ..fast_config()
    };
    let (grid, shutdown, runner) = start(config);
    grid.attach_local_channel(2.0).await;

    let mut last = None;
    for i in 0..5 {
        let job = grid
            .submit_job(format!("job-{}", i), payloads(10), JobSla::default())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while !job.is_terminal() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not finish in time");
        assert!(job.is_done());
        last = Some(job);
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while !grid.job_queue().read().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("finished jobs were not removed");
    let last = last.unwrap();
    assert!(grid.job(last.uuid()).await.is_none());
    assert_eq!(last.completed_task_count(), 10);

    shutdown.cancel();
    runner.await.unwrap();
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn test_run_future_can_be_spawned() {
    let (grid, receivers) = Grid::new(fast_config(), CancellationToken::new());
    let run = grid.run(receivers);
    assert_send(&run);
    drop(run);
}

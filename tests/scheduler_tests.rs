use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskgrid::bundler::BundlerFactory;
use taskgrid::config::{GridConfig, LoadBalancingConfig};
use taskgrid::scheduler::{
    BundleOutcome, ChannelInfo, JobDispatcher, JobEvent, JobEventKind, JobNotifier, JobQueue,
    JobSla, JobStatus, ServerJob, ServerTask,
};
use taskgrid::GridError;

fn job(uuid: &str, count: usize) -> ServerJob {
    ServerJob::new(
        uuid,
        uuid,
        ServerTask::from_payloads((0..count).map(|i| vec![i as u8]).collect()),
    )
    .unwrap()
}

fn dispatcher(algorithm: &str, max_size: usize) -> JobDispatcher {
    let config = LoadBalancingConfig::new(algorithm).with_parameter("size", 4);
    JobDispatcher::new(BundlerFactory::new(&config, max_size), 5000)
}

// =============================================================================
// Queue
// =============================================================================

#[test]
fn test_job_queue_operations() {
    let mut queue = JobQueue::default();
    queue.add_job(job("a", 3)).unwrap();
    queue.add_job(job("b", 2)).unwrap();

    assert_eq!(queue.len(), 2);
    let a = queue.get_job("a").unwrap();
    assert!(a.queue_entry_time().is_some());
    assert_eq!(queue.all_jobs()[0].uuid(), "a");

    assert!(queue.cancel_job("a").unwrap());
    assert!(!queue.cancel_job("a").unwrap());
    assert!(matches!(
        queue.cancel_job("missing"),
        Err(GridError::JobNotFound(_))
    ));
    assert_eq!(queue.jobs_by_priority().len(), 1);

    assert_eq!(queue.cleanup_finished_jobs(), 1);
    assert!(queue.get_job("a").is_none());
    assert!(queue.remove_job("b").is_some());
    assert!(queue.is_empty());
}

#[test]
fn test_job_queue_capacity_and_duplicates() {
    let mut queue = JobQueue::with_capacity(2, Arc::new(JobNotifier::new()));
    queue.add_job(job("a", 1)).unwrap();
    assert!(matches!(
        queue.add_job(job("a", 1)),
        Err(GridError::InvalidJob(_))
    ));
    queue.add_job(job("b", 1)).unwrap();
    assert!(queue.is_full());
    assert!(matches!(
        queue.add_job(job("c", 1)),
        Err(GridError::QueueFull(2))
    ));
}

#[test]
fn test_queue_fires_queued() {
    let notifier = Arc::new(JobNotifier::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    notifier.add_listener(Arc::new(move |event: &JobEvent| {
        sink.lock().unwrap().push((event.kind, event.job.uuid.clone()));
    }));
    let mut queue = JobQueue::new(notifier);

    queue.add_job(job("q", 2)).unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec![(JobEventKind::Queued, "q".to_string())]
    );
}

#[test]
fn test_priority_ordering() {
    let mut queue = JobQueue::default();
    queue
        .add_job(job("low", 1).with_sla(JobSla::default().with_priority(-1)))
        .unwrap();
    queue.add_job(job("first", 1)).unwrap();
    queue.add_job(job("second", 1)).unwrap();
    queue
        .add_job(job("high", 1).with_sla(JobSla::default().with_priority(10)))
        .unwrap();

    let order: Vec<String> = queue
        .jobs_by_priority()
        .iter()
        .map(|j| j.uuid().to_string())
        .collect();
    assert_eq!(order, vec!["high", "first", "second", "low"]);

    assert!(queue.set_priority("low", 20).unwrap());
    assert_eq!(queue.jobs_by_priority()[0].uuid(), "low");
}

#[test]
fn test_max_bundle_size_remembers_last_value() {
    let mut queue = JobQueue::default();
    assert_eq!(queue.max_bundle_size(), 0);

    queue.add_job(job("a", 30)).unwrap();
    queue.add_job(job("b", 70)).unwrap();
    assert_eq!(queue.max_bundle_size(), 70);

    queue.cancel_job("b").unwrap();
    assert_eq!(queue.max_bundle_size(), 30);
    queue.cancel_job("a").unwrap();
    assert_eq!(queue.max_bundle_size(), 30);
}

#[test]
fn test_queue_admin_actions() {
    let mut queue = JobQueue::default();
    queue.add_job(job("s", 4)).unwrap();

    assert!(queue.suspend_job("s", true, false).unwrap());
    assert!(queue.eligible_jobs(1).is_empty());
    assert!(queue.suspend_job("s", false, false).unwrap());
    assert_eq!(queue.eligible_jobs(1).len(), 1);

    assert!(queue.set_max_channels("s", 3).unwrap());
    assert_eq!(queue.get_job("s").unwrap().max_channels(), 3);
    assert!(matches!(
        queue.suspend_job("x", true, true),
        Err(GridError::JobNotFound(_))
    ));
}

// =============================================================================
// Dispatcher
// =============================================================================

#[test]
fn test_attach_and_detach_channel() {
    let queue = JobQueue::default();
    let mut dispatcher = dispatcher("proportional", 100);

    assert!(dispatcher.attach_channel(ChannelInfo::local(1)));
    assert!(!dispatcher.attach_channel(ChannelInfo::local(1)));
    assert!(dispatcher.attach_channel(ChannelInfo::node(2, "node-2")));
    assert_eq!(dispatcher.factory().active_bundlers(), 2);
    assert_eq!(dispatcher.bundle_size(1), Some(10));

    assert_eq!(dispatcher.detach_channel(1, &queue), Some(0));
    assert_eq!(dispatcher.detach_channel(1, &queue), None);
    assert_eq!(dispatcher.factory().active_bundlers(), 1);
    assert_eq!(dispatcher.channel_ids(), vec![2]);
}

#[test]
fn test_heartbeat_auto_attaches() {
    let mut dispatcher = dispatcher("proportional", 100);
    dispatcher.channel_heartbeat(42);

    let channel = dispatcher.channel(42).unwrap();
    assert_eq!(channel.info.identity, "channel-42");
    assert!(!channel.info.local);
    assert_eq!(dispatcher.available_channels(), vec![42]);
    assert!(dispatcher.check_dead_channels().is_empty());
}

#[test]
fn test_dead_channel_detection() {
    let config = LoadBalancingConfig::default();
    let mut dispatcher = JobDispatcher::new(BundlerFactory::new(&config, 10), 0);
    dispatcher.attach_channel(ChannelInfo::local(1));

    assert_eq!(dispatcher.check_dead_channels(), vec![1]);
    assert!(dispatcher.available_channels().is_empty());
}

#[test]
fn test_dispatch_uses_bundler_size() {
    let mut queue = JobQueue::default();
    queue.add_job(job("j", 10)).unwrap();
    let mut dispatcher = dispatcher("manual", 100);
    dispatcher.attach_channel(ChannelInfo::local(1));
    dispatcher.attach_channel(ChannelInfo::local(2));

    let bundles = dispatcher.dispatch_all(&queue);
    assert_eq!(bundles.len(), 2);
    assert!(bundles.iter().all(|b| b.task_count() == 4));
    assert_eq!(bundles[0].channel().id, 1);
    assert_eq!(bundles[1].channel().id, 2);

    // both channels are busy
    assert!(dispatcher.dispatch_next(&queue).is_none());
    assert_eq!(queue.get_job("j").unwrap().status(), JobStatus::Executing);
    assert_eq!(dispatcher.channel(1).unwrap().in_flight_bundles(), vec![bundles[0].id()]);
}

#[test]
fn test_dispatch_follows_priority() {
    let mut queue = JobQueue::default();
    queue.add_job(job("normal", 4)).unwrap();
    queue
        .add_job(job("urgent", 4).with_sla(JobSla::default().with_priority(5)))
        .unwrap();
    let mut dispatcher = dispatcher("manual", 100);
    dispatcher.attach_channel(ChannelInfo::local(1));

    let bundle = dispatcher.dispatch_next(&queue).unwrap();
    assert_eq!(bundle.job_uuid(), "urgent");
}

#[test]
fn test_returned_bundle_feeds_bundler_and_completes_job() {
    let mut queue = JobQueue::default();
    let j = queue.add_job(job("j", 100)).unwrap();
    let mut dispatcher = dispatcher("proportional", 100);
    dispatcher.attach_channel(ChannelInfo::local(1));
    dispatcher.attach_channel(ChannelInfo::local(2));

    let bundles = dispatcher.dispatch_all(&queue);
    assert_eq!(bundles.len(), 2);
    assert!(bundles.iter().all(|b| b.task_count() == 10));

    assert!(dispatcher.bundle_returned(
        1,
        bundles[0].id(),
        BundleOutcome::Completed,
        Duration::from_nanos(10_240),
        &queue,
    ));
    assert!(dispatcher.bundle_returned(
        2,
        bundles[1].id(),
        BundleOutcome::Completed,
        Duration::from_nanos(40_960),
        &queue,
    ));
    // channel 1 is four times faster; 80 tasks are left to share
    assert_eq!(dispatcher.bundle_size(1), Some(64));
    assert_eq!(dispatcher.bundle_size(2), Some(16));
    assert!(!dispatcher.bundle_returned(
        2,
        bundles[1].id(),
        BundleOutcome::Completed,
        Duration::ZERO,
        &queue,
    ));

    while !j.is_terminal() {
        for bundle in dispatcher.dispatch_all(&queue) {
            dispatcher.bundle_returned(
                bundle.channel().id,
                bundle.id(),
                BundleOutcome::Completed,
                Duration::from_micros(10 * bundle.task_count() as u64),
                &queue,
            );
        }
    }
    assert!(j.is_done());
    assert_eq!(j.completed_task_count(), 100);
}

#[test]
fn test_detach_requeues_in_flight_bundles() {
    let mut queue = JobQueue::default();
    let j = queue.add_job(job("j", 8)).unwrap();
    let mut dispatcher = dispatcher("manual", 100);
    dispatcher.attach_channel(ChannelInfo::local(1));

    let bundle = dispatcher.dispatch_next(&queue).unwrap();
    assert_eq!(j.task_count(), 4);

    assert_eq!(dispatcher.detach_channel(1, &queue), Some(1));
    assert_eq!(j.task_count(), 8);
    assert!(!j.is_terminal());

    // the late result from the detached channel is ignored
    assert!(!dispatcher.bundle_returned(
        1,
        bundle.id(),
        BundleOutcome::Completed,
        Duration::ZERO,
        &queue,
    ));
    assert_eq!(j.completed_task_count(), 0);
}

#[test]
fn test_result_for_removed_job_is_dropped() {
    let mut queue = JobQueue::default();
    queue.add_job(job("gone", 4)).unwrap();
    let mut dispatcher = dispatcher("manual", 100);
    dispatcher.attach_channel(ChannelInfo::local(1));
    let bundle = dispatcher.dispatch_next(&queue).unwrap();

    queue.remove_job("gone");
    assert!(dispatcher.bundle_returned(
        1,
        bundle.id(),
        BundleOutcome::Completed,
        Duration::from_millis(1),
        &queue,
    ));
    assert!(dispatcher.channel(1).unwrap().is_idle());
}

#[test]
fn test_broadcast_job_reaches_every_channel() {
    let mut queue = JobQueue::default();
    let j = queue
        .add_job(job("b", 3).with_sla(JobSla::default().broadcast()))
        .unwrap();
    let mut dispatcher = dispatcher("manual", 100);
    for id in 1..=3 {
        dispatcher.attach_channel(ChannelInfo::local(id));
    }

    let bundles = dispatcher.dispatch_all(&queue);
    assert_eq!(bundles.len(), 3);
    assert!(bundles.iter().all(|b| b.task_count() == 3));

    for bundle in &bundles {
        assert!(!j.is_terminal());
        dispatcher.bundle_returned(
            bundle.channel().id,
            bundle.id(),
            BundleOutcome::Completed,
            Duration::from_millis(1),
            &queue,
        );
    }
    assert!(j.is_done());
    assert_eq!(j.completed_task_count(), 9);
}

#[test]
fn test_broadcast_job_ends_when_holding_channel_detaches() {
    let mut queue = JobQueue::default();
    let j = queue
        .add_job(job("b", 2).with_sla(JobSla::default().broadcast()))
        .unwrap();
    let mut dispatcher = dispatcher("manual", 100);
    dispatcher.attach_channel(ChannelInfo::local(1));
    dispatcher.attach_channel(ChannelInfo::local(2));

    let bundles = dispatcher.dispatch_all(&queue);
    assert_eq!(bundles.len(), 2);
    let first = bundles.iter().find(|b| b.channel().id == 1).unwrap();
    dispatcher.bundle_returned(
        1,
        first.id(),
        BundleOutcome::Completed,
        Duration::from_millis(1),
        &queue,
    );
    assert!(!j.is_terminal());

    assert_eq!(dispatcher.detach_channel(2, &queue), Some(1));
    assert!(j.is_done());
    assert!(j.in_flight_channels().is_empty());
    assert_eq!(j.completed_task_count(), 2);
    assert!(dispatcher.dispatch_all(&queue).is_empty());
}

#[test]
fn test_broadcast_job_ends_when_unreached_channel_detaches() {
    let mut queue = JobQueue::default();
    let j = queue
        .add_job(job("b", 2).with_sla(JobSla::default().broadcast()))
        .unwrap();
    let mut dispatcher = dispatcher("manual", 100);
    dispatcher.attach_channel(ChannelInfo::local(1));
    let bundle = dispatcher.dispatch_next(&queue).unwrap();
    assert_eq!(bundle.job_uuid(), "b");

    // channel 2 is kept busy by a more urgent job and never receives the broadcast
    queue
        .add_job(job("urgent", 1).with_sla(JobSla::default().with_priority(5)))
        .unwrap();
    dispatcher.attach_channel(ChannelInfo::local(2));
    let urgent = dispatcher.dispatch_next(&queue).unwrap();
    assert_eq!(urgent.job_uuid(), "urgent");
    assert_eq!(urgent.channel().id, 2);

    dispatcher.bundle_returned(
        1,
        bundle.id(),
        BundleOutcome::Completed,
        Duration::from_millis(1),
        &queue,
    );
    assert!(!j.is_terminal());

    assert_eq!(dispatcher.detach_channel(2, &queue), Some(1));
    assert!(j.is_done());
}

#[test]
fn test_dispatcher_from_config() {
    let config = GridConfig::default()
        .with_load_balancing(LoadBalancingConfig::new("manual").with_parameter("size", 2));
    let mut dispatcher = JobDispatcher::from_config(&config);
    assert_eq!(dispatcher.factory().algorithm(), "manual");
    assert_eq!(dispatcher.factory().max_size(), 300);

    dispatcher.attach_channel(ChannelInfo::local(1));
    assert_eq!(dispatcher.bundle_size(1), Some(2));
}

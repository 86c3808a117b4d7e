use super::*;
use crate::blocking::ScopedBlockingCall;
use crate::delayed_task_manager::{DefaultTickClock, DelayedTaskManager};
use crate::sequence::Sequence;
use crate::task::Task;
use crate::task_source::TaskSourceExecutionMode;
use std::sync::atomic::AtomicUsize;

fn test_service() -> Arc<DelayedTaskManager> {
    let service = Arc::new(DelayedTaskManager::new(Arc::new(DefaultTickClock)));
    service.start();
    service
}

fn start_params(
    max_tasks: usize,
    max_best_effort_tasks: usize,
    service: &Arc<DelayedTaskManager>,
) -> ThreadGroupStartParams {
    ThreadGroupStartParams {
        max_tasks,
        max_best_effort_tasks,
        suggested_reclaim_time: Duration::from_secs(30),
        no_worker_reclaim: false,
        worker_environment: WorkerEnvironment::None,
        may_block_threshold: None,
        blocked_workers_poll_period: None,
        service: service.clone(),
        worker_thread_observer: None,
    }
}

/// Posts a one-off task to `group` the way the pool's immediate-post path does.
fn post_task_to_group(
    tracker: &Arc<TaskTracker>,
    group: &Arc<ThreadGroup>,
    traits: TaskTraits,
    closure: impl FnOnce() + Send + 'static,
) -> bool {
    let sequence = Sequence::new(traits, TaskSourceExecutionMode::Parallel);
    let mut task = Task::new(closure);
    if !tracker.will_post_task(&mut task, traits.shutdown_behavior) {
        Task::leak(task);
        return false;
    }
    let mut transaction = sequence.begin_transaction();
    assert!(transaction.will_push_immediate_task());
    let Some(registered) = tracker.register_task_source(sequence.clone()) else {
        tracker.did_not_post_task(traits.shutdown_behavior);
        return false;
    };
    if !tracker.will_post_task_now(&task, transaction.traits().priority) {
        tracker.did_not_post_task(traits.shutdown_behavior);
        return false;
    }
    transaction.push_immediate_task(task, None);
    drop(transaction);
    group.push_task_source_and_wake_up_workers(registered);
    true
}

struct GroupHarness {
    tracker: Arc<TaskTracker>,
    group: Arc<ThreadGroup>,
    service: Arc<DelayedTaskManager>,
}

impl GroupHarness {
    fn new(params_fn: impl FnOnce(&Arc<DelayedTaskManager>) -> ThreadGroupStartParams) -> GroupHarness {
        let tracker = TaskTracker::new();
        let service = test_service();
        let group = ThreadGroup::new("test", ThreadType::Default, tracker.clone());
        group.start(params_fn(&service));
        GroupHarness {
            tracker,
            group,
            service,
        }
    }

    fn post(&self, traits: TaskTraits, closure: impl FnOnce() + Send + 'static) {
        assert!(post_task_to_group(&self.tracker, &self.group, traits, closure));
    }

    fn teardown(self) {
        self.tracker.flush_for_testing();
        self.group.join_for_testing();
        self.service.shutdown();
    }
}

fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

#[test]
fn runs_a_posted_task() {
    let harness = GroupHarness::new(|service| start_params(2, 1, service));
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    harness.post(TaskTraits::new(), move || {
        ran2.fetch_add(1, Ordering::Relaxed);
    });
    harness.tracker.flush_for_testing();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
    harness.teardown();
}

#[test]
fn runs_tasks_concurrently_up_to_max_tasks() {
    let harness = GroupHarness::new(|service| start_params(3, 1, service));

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let release = release.clone();
        let concurrent = concurrent.clone();
        let peak = peak.clone();
        harness.post(TaskTraits::new(), move || {
            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            release.wait();
            concurrent.fetch_sub(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(5), || {
        concurrent.load(Ordering::SeqCst) == 3
    }));
    release.signal();
    harness.tracker.flush_for_testing();
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    harness.teardown();
}

#[test]
fn best_effort_tasks_are_capped_separately() {
    let harness = GroupHarness::new(|service| start_params(4, 1, service));

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let concurrent_best_effort = Arc::new(AtomicUsize::new(0));
    let peak_best_effort = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let release = release.clone();
        let concurrent = concurrent_best_effort.clone();
        let peak = peak_best_effort.clone();
        harness.post(
            TaskTraits::new().with_priority(TaskPriority::BestEffort),
            move || {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                release.wait();
                concurrent.fetch_sub(1, Ordering::SeqCst);
            },
        );
    }

    // Give the group a chance to (incorrectly) start more than one.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(harness.group.max_best_effort_tasks_for_testing(), 1);
    assert_eq!(concurrent_best_effort.load(Ordering::SeqCst), 1);
    release.signal();
    harness.tracker.flush_for_testing();
    assert_eq!(peak_best_effort.load(Ordering::SeqCst), 1);
    harness.teardown();
}

#[test]
fn will_block_scope_raises_max_tasks_immediately() {
    let harness = GroupHarness::new(|service| start_params(1, 1, service));

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let second_ran = Arc::new(WaitableEvent::new(ResetPolicy::Manual));

    let release2 = release.clone();
    harness.post(TaskTraits::new(), move || {
        let _blocking = ScopedBlockingCall::new(BlockingType::WillBlock);
        release2.wait();
    });
    let second_ran2 = second_ran.clone();
    harness.post(TaskTraits::new(), move || {
        second_ran2.signal();
    });

    // The WillBlock scope frees the first worker's slot, so the second task runs while the first
    // is still blocked.
    assert!(second_ran.timed_wait(Duration::from_secs(5)));
    assert_eq!(harness.group.max_tasks_for_testing(), 2);
    release.signal();
    harness.tracker.flush_for_testing();
    // The adjustment was reverted when the scope ended.
    assert_eq!(harness.group.max_tasks_for_testing(), 1);
    harness.teardown();
}

#[test]
fn may_block_scope_expands_after_threshold() {
    let harness = GroupHarness::new(|service| ThreadGroupStartParams {
        may_block_threshold: Some(Duration::from_millis(5)),
        blocked_workers_poll_period: Some(Duration::from_millis(10)),
        ..start_params(2, 1, service)
    });
    assert_eq!(
        harness.group.may_block_threshold_for_testing(),
        Duration::from_millis(5)
    );

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let third_ran = Arc::new(WaitableEvent::new(ResetPolicy::Manual));

    let release1 = release.clone();
    harness.post(TaskTraits::new(), move || {
        let _blocking = ScopedBlockingCall::new(BlockingType::MayBlock);
        release1.wait();
    });
    let release2 = release.clone();
    harness.post(TaskTraits::new(), move || {
        release2.wait();
    });
    let third_ran2 = third_ran.clone();
    harness.post(TaskTraits::new(), move || {
        third_ran2.signal();
    });

    // After the threshold elapses, the poll converts the MayBlock scope into extra capacity and
    // the third task runs concurrently with the two blocked ones.
    assert!(third_ran.timed_wait(Duration::from_secs(5)));
    assert_eq!(harness.group.max_tasks_for_testing(), 3);

    release.signal();
    harness.tracker.flush_for_testing();
    assert_eq!(harness.group.max_tasks_for_testing(), 2);
    harness.teardown();
}

#[test]
fn may_block_scope_shorter_than_threshold_has_no_effect() {
    let harness = GroupHarness::new(|service| ThreadGroupStartParams {
        may_block_threshold: Some(Duration::from_secs(30)),
        ..start_params(2, 1, service)
    });

    harness.post(TaskTraits::new(), move || {
        let _blocking = ScopedBlockingCall::new(BlockingType::MayBlock);
    });
    harness.tracker.flush_for_testing();
    assert_eq!(harness.group.max_tasks_for_testing(), 2);
    harness.teardown();
}

#[test]
fn should_yield_when_higher_priority_work_waits() {
    let harness = GroupHarness::new(|service| start_params(1, 1, service));

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let running = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let release2 = release.clone();
    let running2 = running.clone();
    harness.post(
        TaskTraits::new().with_priority(TaskPriority::BestEffort),
        move || {
            running2.signal();
            release2.wait();
        },
    );
    assert!(running.timed_wait(Duration::from_secs(5)));

    // Queue a user-blocking source behind the running best-effort task.
    let blocked_counter = Arc::new(AtomicUsize::new(0));
    let blocked_counter2 = blocked_counter.clone();
    harness.post(
        TaskTraits::new().with_priority(TaskPriority::UserBlocking),
        move || {
            blocked_counter2.fetch_add(1, Ordering::Relaxed);
        },
    );

    let running_key = TaskSourceSortKey::new(TaskPriority::BestEffort, 1, Instant::now());
    assert!(wait_until(Duration::from_secs(5), || {
        harness.group.should_yield(running_key)
    }));
    // One yield resets the sentinel: asking again does not demand another yield.
    assert!(!harness.group.should_yield(running_key));

    release.signal();
    harness.tracker.flush_for_testing();
    assert_eq!(blocked_counter.load(Ordering::Relaxed), 1);
    harness.teardown();
}

#[test]
fn handoff_round_trip_is_identity_on_queued_sources() {
    let tracker = TaskTracker::new();
    let group_a = ThreadGroup::new("a", ThreadType::Default, tracker.clone());
    let group_b = ThreadGroup::new("b", ThreadType::Default, tracker.clone());

    // Unstarted groups: sources stay queued.
    for priority in [
        TaskPriority::UserBlocking,
        TaskPriority::UserVisible,
        TaskPriority::BestEffort,
        TaskPriority::UserBlocking,
    ] {
        assert!(post_task_to_group(
            &tracker,
            &group_a,
            TaskTraits::new().with_priority(priority),
            || {},
        ));
    }
    assert_eq!(group_a.num_queued_task_sources_for_testing(), 4);

    group_a.handoff_all_task_sources_to_other_thread_group(&group_b);
    assert_eq!(group_a.num_queued_task_sources_for_testing(), 0);
    assert_eq!(group_b.num_queued_task_sources_for_testing(), 4);

    group_b.handoff_all_task_sources_to_other_thread_group(&group_a);
    assert_eq!(group_a.num_queued_task_sources_for_testing(), 4);
    assert_eq!(group_b.num_queued_task_sources_for_testing(), 0);

    // Selective handoff: the user-blocking sources stay behind.
    group_a.handoff_non_user_blocking_task_sources_to_other_thread_group(&group_b);
    assert_eq!(group_a.num_queued_task_sources_for_testing(), 2);
    assert_eq!(group_b.num_queued_task_sources_for_testing(), 2);

    group_a.join_for_testing();
    group_b.join_for_testing();
}

#[test]
fn excess_worker_reclaims_after_idle_period() {
    let harness = GroupHarness::new(|service| ThreadGroupStartParams {
        suggested_reclaim_time: Duration::from_millis(50),
        ..start_params(2, 1, service)
    });

    harness.post(TaskTraits::new(), || {});
    harness.tracker.flush_for_testing();
    assert!(harness.group.num_workers_for_testing() >= 1);

    // Every worker in this group is excess; all of them reclaim after the idle timeout.
    harness.group.wait_for_workers_cleaned_up_for_testing(1);
    assert!(wait_until(Duration::from_secs(5), || {
        harness.group.num_workers_for_testing() == 0
    }));
    harness.teardown();
}

#[test]
fn double_wake_up_dequeues_once_and_records_one_unnecessary_wakeup() {
    let harness = GroupHarness::new(|service| start_params(1, 1, service));

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let running = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let runs = Arc::new(AtomicUsize::new(0));

    let release2 = release.clone();
    let running2 = running.clone();
    let runs2 = runs.clone();
    harness.post(TaskTraits::new(), move || {
        running2.signal();
        runs2.fetch_add(1, Ordering::SeqCst);
        release2.wait();
    });
    assert!(running.timed_wait(Duration::from_secs(5)));

    let workers = harness.group.workers_for_testing();
    assert_eq!(workers.len(), 1);
    workers[0].wake_up();
    workers[0].wake_up();

    release.signal();
    harness.tracker.flush_for_testing();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(wait_until(Duration::from_secs(5), || {
        harness.group.num_unnecessary_wakeups_for_testing() <= 1
            && harness.group.num_idle_workers_for_testing() == 1
    }));
    assert!(harness.group.num_unnecessary_wakeups_for_testing() <= 1);
    harness.teardown();
}

#[test]
fn shutdown_compensates_for_continue_on_shutdown_tasks() {
    let harness = GroupHarness::new(|service| start_params(1, 1, service));

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let running = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let release2 = release.clone();
    let running2 = running.clone();
    harness.post(
        TaskTraits::new().with_shutdown_behavior(TaskShutdownBehavior::ContinueOnShutdown),
        move || {
            running2.signal();
            release2.wait();
        },
    );
    assert!(running.timed_wait(Duration::from_secs(5)));

    harness.tracker.start_shutdown();
    harness.group.on_shutdown_started();
    // The worker stuck in the ContinueOnShutdown task no longer counts against the limit.
    assert_eq!(harness.group.max_tasks_for_testing(), 2);

    release.signal();
    harness.tracker.complete_shutdown();
    assert!(wait_until(Duration::from_secs(5), || {
        harness.group.max_tasks_for_testing() == 1
    }));
    // Workers exit once shutdown is complete; join is still required to reap the threads.
    harness.group.join_for_testing();
    harness.service.shutdown();
}

#[test]
fn set_max_tasks_preserves_blocking_adjustments() {
    let harness = GroupHarness::new(|service| start_params(4, 2, service));

    let release = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let in_scope = Arc::new(WaitableEvent::new(ResetPolicy::Manual));
    let release2 = release.clone();
    let in_scope2 = in_scope.clone();
    harness.post(TaskTraits::new(), move || {
        let _blocking = ScopedBlockingCall::new(BlockingType::WillBlock);
        in_scope2.signal();
        release2.wait();
    });
    assert!(in_scope.timed_wait(Duration::from_secs(5)));
    assert_eq!(harness.group.max_tasks_for_testing(), 5);

    harness.group.set_max_tasks(2);
    // New baseline 2, plus the one outstanding blocking adjustment.
    assert_eq!(harness.group.max_tasks_for_testing(), 3);
    harness.group.reset_max_tasks();
    assert_eq!(harness.group.max_tasks_for_testing(), 5);

    release.signal();
    harness.tracker.flush_for_testing();
    assert_eq!(harness.group.max_tasks_for_testing(), 4);
    harness.teardown();
}

//! Tests for the runner module

use super::shared::{build_limiter, NoHooks, RunHooks, RunnerCore};
use super::*;
use crate::channel::ChannelConfig;
use crate::config::{MasterConfig, Profile};
use crate::error::SwarmError;
use crate::node::{WorkerNode, WorkerNodes};
use crate::state::State;
use crate::stats::{ReportData, ReportSink};
use crate::task::{Task, TaskPayload};
use crate::transport::{HeartbeatData, Message, NodeInfo};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct CollectingSink {
    reports: Mutex<Vec<ReportData>>,
}

#[async_trait]
impl ReportSink for CollectingSink {
    async fn publish(&self, report: ReportData) {
        self.reports.lock().push(report);
    }
}

impl CollectingSink {
    fn failures(&self, method: &str, name: &str) -> i64 {
        self.reports
            .lock()
            .iter()
            .flat_map(|report| report.stats.iter())
            .filter(|entry| entry.method == method && entry.name == name)
            .map(|entry| entry.num_failures)
            .sum()
    }
}

#[derive(Default)]
struct CountingHooks {
    completes: AtomicUsize,
    panics: AtomicUsize,
    stopped: AtomicUsize,
}

impl RunHooks for CountingHooks {
    fn spawn_complete(&self, _user_count: i64) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }

    fn task_panicked(&self, _error: &str) {
        self.panics.fetch_add(1, Ordering::SeqCst);
    }

    fn stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting_task(counter: Arc<AtomicUsize>, pause: Duration) -> Task {
    Task::new("count", 1, move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                sleep(pause).await;
            }
        }
    })
}

fn new_core() -> Arc<RunnerCore> {
    Arc::new(RunnerCore::new(&ChannelConfig::default()))
}

fn spawn_ramp(
    controller: &Arc<Controller>,
    stopping: &CancellationToken,
) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    let launched = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let handle = {
        let controller = Arc::clone(controller);
        let stopping = stopping.clone();
        let launched = Arc::clone(&launched);
        let completed = Arc::clone(&completed);
        tokio::spawn(async move {
            controller
                .spawn_workers(
                    stopping,
                    || {
                        launched.fetch_add(1, Ordering::SeqCst);
                    },
                    || {
                        completed.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .await;
        })
    };
    (launched, completed, handle)
}

// ============================================================================
// Controller Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_ramp_converges_at_spawn_rate() {
    let controller = Arc::new(Controller::new(10, 10.0));
    let stopping = CancellationToken::new();
    let (launched, completed, handle) = spawn_ramp(&controller, &stopping);

    sleep(Duration::from_millis(550)).await;
    assert_eq!(launched.load(Ordering::SeqCst), 5);
    assert!(!controller.is_spawn_complete());

    sleep(Duration::from_millis(550)).await;
    assert_eq!(launched.load(Ordering::SeqCst), 10);
    assert_eq!(controller.current_clients(), 10);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(controller.is_spawn_complete());

    stopping.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rebalance_down_then_up() {
    let controller = Arc::new(Controller::new(10, 100.0));
    let stopping = CancellationToken::new();
    let (launched, _completed, handle) = spawn_ramp(&controller, &stopping);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.current_clients(), 10);

    controller.set_spawn(4, 0.0);
    assert_eq!(controller.spawn_count(), 4);
    assert_eq!(controller.spawn_rate(), 100.0);

    let shed = (0..10).filter(|_| controller.erase()).count();
    assert_eq!(shed, 6);
    assert_eq!(controller.current_clients(), 4);
    assert!(!controller.erase());

    controller.set_spawn(6, 0.0);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.current_clients(), 6);
    assert_eq!(launched.load(Ordering::SeqCst), 12);
    assert!(controller.is_spawn_complete());

    stopping.cancel();
    handle.await.unwrap();
}

#[test]
fn test_acquire_never_exceeds_target() {
    let controller = Controller::new(3, 1.0);
    let acquired = (0..5).filter(|_| controller.acquire()).count();
    assert_eq!(acquired, 3);
    assert_eq!(controller.current_clients(), 3);
    assert_eq!(controller.release(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stopping_releases_pending_slot() {
    let controller = Arc::new(Controller::new(5, 1.0));
    let stopping = CancellationToken::new();
    let (launched, _completed, handle) = spawn_ramp(&controller, &stopping);

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(launched.load(Ordering::SeqCst), 1);
    // The second slot is claimed and waiting out its spawn interval.
    assert_eq!(controller.current_clients(), 2);

    stopping.cancel();
    handle.await.unwrap();
    assert_eq!(controller.current_clients(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_released_slot_reopens_only_on_set_spawn() {
    let controller = Arc::new(Controller::new(2, 100.0));
    let stopping = CancellationToken::new();
    let (launched, completed, handle) = spawn_ramp(&controller, &stopping);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(launched.load(Ordering::SeqCst), 2);

    // A user leaving on its own does not get replaced.
    assert_eq!(controller.release(), 1);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(launched.load(Ordering::SeqCst), 2);
    assert_eq!(controller.current_clients(), 1);

    controller.set_spawn(2, 0.0);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(launched.load(Ordering::SeqCst), 3);
    assert_eq!(controller.current_clients(), 2);
    assert_eq!(completed.load(Ordering::SeqCst), 2);

    stopping.cancel();
    handle.await.unwrap();
}

// ============================================================================
// Loop Quota Tests
// ============================================================================

#[test]
fn test_loop_quota() {
    let quota = LoopQuota::new(3);
    assert!(quota.acquire());
    assert!(quota.acquire());
    assert!(quota.acquire());
    assert!(!quota.acquire());

    quota.finish();
    quota.finish();
    assert!(!quota.is_finished());
    quota.finish();
    assert!(quota.is_finished());
    assert_eq!(quota.finished(), 3);
}

#[test]
fn test_loop_quota_per_user_truncates() {
    assert_eq!(LoopQuota::new(4).per_user(2), 2);
    assert_eq!(LoopQuota::new(10).per_user(3), 3);
    assert_eq!(LoopQuota::new(1).per_user(4), 1);
    assert_eq!(LoopQuota::new(3).per_user(0), 3);
}

// ============================================================================
// Run Lifecycle Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_loop_count_split_across_users() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(CollectingSink::default());

    let run = core
        .start(
            Profile::new(2, 100.0).with_loop_count(4),
            vec![counting_task(Arc::clone(&counter), Duration::ZERO)],
            sink,
            Arc::new(NoHooks),
        )
        .unwrap();

    timeout(Duration::from_secs(5), run.finished()).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(run.loop_quota().unwrap().finished(), 4);
    assert_eq!(core.state(), State::Stopped);
    assert_eq!(core.user_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_truncated_loop_count_still_stops() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));

    // 5 / 2 truncates to 2 per user, so the global quota is never reached.
    let run = core
        .start(
            Profile::new(2, 100.0).with_loop_count(5),
            vec![counting_task(Arc::clone(&counter), Duration::ZERO)],
            Arc::new(CollectingSink::default()),
            Arc::new(NoHooks),
        )
        .unwrap();

    timeout(Duration::from_secs(5), run.finished()).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(core.state(), State::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_users_exhausted_during_ramp_are_not_replaced() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));

    // 7 / 3 gives each user 2; every user finishes before the next one is
    // spawned, so the freed slots must stay closed.
    let run = core
        .start(
            Profile::new(3, 10.0).with_loop_count(7),
            vec![counting_task(Arc::clone(&counter), Duration::ZERO)],
            Arc::new(CollectingSink::default()),
            Arc::new(NoHooks),
        )
        .unwrap();

    timeout(Duration::from_secs(5), run.finished()).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 6);
    assert_eq!(run.controller.launched(), 3);
    assert_eq!(core.state(), State::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_second_stop_waits_for_the_first() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));

    core.start(
        Profile::new(2, 100.0),
        vec![counting_task(Arc::clone(&counter), Duration::from_millis(500))],
        Arc::new(CollectingSink::default()),
        Arc::new(NoHooks),
    )
    .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(core.user_count(), 2);

    let first = tokio::spawn({
        let core = Arc::clone(&core);
        async move { core.stop().await }
    });
    tokio::task::yield_now().await;
    assert_eq!(core.state(), State::Stopping);

    core.stop().await.unwrap();
    assert_eq!(core.state(), State::Stopped);
    assert_eq!(core.user_count(), 0);
    first.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_task_panic_is_recorded_and_run_continues() {
    let core = new_core();
    let sink = Arc::new(CollectingSink::default());
    let hooks = Arc::new(CountingHooks::default());
    let task = Task::new("boom", 1, || async { panic!("boom") });

    let run = core
        .start(
            Profile::new(1, 10.0).with_loop_count(3),
            vec![task],
            Arc::clone(&sink) as Arc<dyn ReportSink>,
            Arc::clone(&hooks) as Arc<dyn RunHooks>,
        )
        .unwrap();

    timeout(Duration::from_secs(5), run.finished()).await.unwrap();
    assert_eq!(hooks.panics.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.completes.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(sink.failures("unknown", "panic"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_time_stops_run() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let run = core
        .start(
            Profile::new(2, 10.0).with_run_time(2),
            vec![counting_task(Arc::clone(&counter), Duration::from_millis(100))],
            Arc::new(CollectingSink::default()),
            Arc::new(NoHooks),
        )
        .unwrap();

    timeout(Duration::from_secs(10), run.finished()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(counter.load(Ordering::SeqCst) > 0);
    assert_eq!(core.state(), State::Stopped);
    assert_eq!(core.user_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_state_transitions_across_runs() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks = vec![counting_task(Arc::clone(&counter), Duration::from_millis(10))];
    let sink: Arc<dyn ReportSink> = Arc::new(CollectingSink::default());

    core.start(Profile::new(2, 100.0), tasks.clone(), Arc::clone(&sink), Arc::new(NoHooks))
        .unwrap();
    assert_eq!(core.state(), State::Spawning);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(core.state(), State::Running);
    assert_eq!(core.user_count(), 2);

    // Starting again while running is rejected.
    let err = core
        .start(Profile::new(2, 100.0), tasks.clone(), Arc::clone(&sink), Arc::new(NoHooks))
        .unwrap_err();
    assert!(matches!(err, SwarmError::InvalidTransition { .. }));

    core.stop().await.unwrap();
    assert_eq!(core.state(), State::Stopped);
    assert!(core.rebalance(&Profile::new(1, 1.0)).is_err());

    core.start(Profile::new(1, 100.0), tasks, sink, Arc::new(NoHooks))
        .unwrap();
    assert_eq!(core.state(), State::Spawning);
    core.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rebalance_live_run() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));
    let hooks = Arc::new(CountingHooks::default());

    core.start(
        Profile::new(4, 100.0),
        vec![counting_task(Arc::clone(&counter), Duration::from_millis(10))],
        Arc::new(CollectingSink::default()),
        Arc::clone(&hooks) as Arc<dyn RunHooks>,
    )
    .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(core.user_count(), 4);

    core.rebalance(&Profile::new(2, 100.0)).unwrap();
    assert_eq!(core.state(), State::Spawning);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(core.user_count(), 2);
    assert_eq!(core.state(), State::Running);
    assert_eq!(hooks.completes.load(Ordering::SeqCst), 2);

    core.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_max_rps_throttles_tasks() {
    let core = new_core();
    let counter = Arc::new(AtomicUsize::new(0));

    let run = core
        .start(
            Profile::new(1, 10.0).with_max_rps(5).with_run_time(3),
            vec![counting_task(Arc::clone(&counter), Duration::ZERO)],
            Arc::new(CollectingSink::default()),
            Arc::new(NoHooks),
        )
        .unwrap();

    timeout(Duration::from_secs(10), run.finished()).await.unwrap();
    let count = counter.load(Ordering::SeqCst);
    assert!((10..=20).contains(&count), "count = {count}");
}

#[tokio::test]
async fn test_start_rejects_bad_input() {
    let core = new_core();
    let sink: Arc<dyn ReportSink> = Arc::new(CollectingSink::default());

    let err = core
        .start(Profile::new(1, 1.0), Vec::new(), Arc::clone(&sink), Arc::new(NoHooks))
        .unwrap_err();
    assert!(err.is_config());

    let task = counting_task(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
    let err = core
        .start(
            Profile::new(1, 1.0).with_request_increase_rate("ten"),
            vec![task],
            sink,
            Arc::new(NoHooks),
        )
        .unwrap_err();
    assert!(err.is_config());
    assert_eq!(core.state(), State::Init);
}

#[tokio::test]
async fn test_limiter_selection() {
    assert!(build_limiter(&Profile::new(1, 1.0)).unwrap().is_none());
    assert!(build_limiter(&Profile::new(1, 1.0).with_max_rps(10)).unwrap().is_some());
    assert!(build_limiter(&Profile::new(1, 1.0).with_request_increase_rate("5/2s"))
        .unwrap()
        .is_some());
}

// ============================================================================
// Master Tests
// ============================================================================

fn attached_node(nodes: &WorkerNodes, id: &str) -> (Arc<WorkerNode>, mpsc::UnboundedReceiver<Message>) {
    let node = nodes.insert(WorkerNode::new(NodeInfo::local(id)));
    let (tx, rx) = mpsc::unbounded_channel();
    node.attach(tx);
    (node, rx)
}

fn serve_tasks(master: &MasterRunner, payload: TaskPayload) {
    let mut requests = master.take_task_requests().unwrap();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            request.respond(payload.clone());
        }
    });
}

fn heartbeat(state: State, user_count: i64) -> HeartbeatData {
    HeartbeatData {
        state,
        cpu_usage: 1.0,
        memory_usage: 16.0,
        user_count,
    }
}

fn expect_spawn(rx: &mut mpsc::UnboundedReceiver<Message>) -> Profile {
    match rx.try_recv() {
        Ok(Message::Spawn { profile, .. }) => profile,
        other => panic!("expected spawn, got {other:?}"),
    }
}

#[tokio::test]
async fn test_master_start_splits_and_reaches_running() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(10, 4.0));
    serve_tasks(&master, TaskPayload::new(b"[]".to_vec()));
    let (a, mut rx_a) = attached_node(master.nodes(), "a");
    let (b, mut rx_b) = attached_node(master.nodes(), "b");

    master.start().await.unwrap();
    assert_eq!(master.state(), State::Spawning);

    for rx in [&mut rx_a, &mut rx_b] {
        let share = expect_spawn(rx);
        assert_eq!(share.spawn_count, 5);
        assert_eq!(share.spawn_rate, 2.0);
    }

    a.beat(&heartbeat(State::Running, 5));
    b.beat(&heartbeat(State::Spawning, 4));
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Spawning);

    b.beat(&heartbeat(State::Running, 5));
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Running);
    assert_eq!(master.user_count(), 10);
}

#[tokio::test]
async fn test_master_stop_completes_when_workers_ready() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(2, 2.0));
    serve_tasks(&master, TaskPayload::default());
    let (a, mut rx_a) = attached_node(master.nodes(), "a");
    let (b, _rx_b) = attached_node(master.nodes(), "b");

    master.start().await.unwrap();
    expect_spawn(&mut rx_a);
    a.beat(&heartbeat(State::Running, 1));
    b.beat(&heartbeat(State::Running, 1));
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Running);

    master.stop().unwrap();
    assert_eq!(master.state(), State::Stopping);
    assert!(matches!(rx_a.try_recv(), Ok(Message::Stop)));

    a.set_state(State::Stopped);
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Stopping);

    b.set_state(State::Stopped);
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Stopped);
}

#[tokio::test]
async fn test_master_stops_when_no_worker_runs() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(1, 1.0));
    serve_tasks(&master, TaskPayload::default());
    let (a, _rx) = attached_node(master.nodes(), "a");

    master.start().await.unwrap();
    a.beat(&heartbeat(State::Running, 1));
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Running);

    a.beat(&heartbeat(State::Stopped, 0));
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Stopping);
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Stopped);
}

#[tokio::test]
async fn test_master_rebalances_when_worker_joins() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(10, 10.0));
    serve_tasks(&master, TaskPayload::new(b"tasks".to_vec()));
    let (a, mut rx_a) = attached_node(master.nodes(), "a");
    let (b, mut rx_b) = attached_node(master.nodes(), "b");

    master.start().await.unwrap();
    expect_spawn(&mut rx_a);
    expect_spawn(&mut rx_b);
    a.beat(&heartbeat(State::Running, 5));
    b.beat(&heartbeat(State::Running, 5));
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Running);

    let (_c, mut rx_c) = attached_node(master.nodes(), "c");
    master.tick_state_machine().await;
    assert_eq!(master.state(), State::Spawning);

    match rx_a.try_recv() {
        Ok(Message::Rebalance { profile }) => assert_eq!(profile.spawn_count, 3),
        other => panic!("expected rebalance, got {other:?}"),
    }
    assert!(matches!(rx_b.try_recv(), Ok(Message::Rebalance { .. })));
    match rx_c.try_recv() {
        Ok(Message::Spawn { profile, tasks }) => {
            assert_eq!(profile.spawn_count, 4);
            assert_eq!(tasks.as_bytes(), b"tasks");
        }
        other => panic!("expected spawn, got {other:?}"),
    }
}

#[tokio::test]
async fn test_master_start_requires_workers() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(1, 1.0));
    serve_tasks(&master, TaskPayload::default());
    assert!(matches!(master.start().await, Err(SwarmError::NoWorkers)));

    attached_node(master.nodes(), "a");
    attached_node(master.nodes(), "b");
    let err = master.start().await.unwrap_err();
    assert!(matches!(
        err,
        SwarmError::SpawnCountTooSmall {
            spawn_count: 1,
            workers: 2
        }
    ));
    assert_eq!(master.state(), State::Init);
}

#[tokio::test]
async fn test_master_start_rejects_limits_below_worker_count() {
    let master = MasterRunner::new(
        MasterConfig::default(),
        Profile::new(2, 1.0).with_loop_count(1),
    );
    serve_tasks(&master, TaskPayload::default());
    let (_a, mut rx_a) = attached_node(master.nodes(), "a");
    attached_node(master.nodes(), "b");

    let err = master.start().await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(master.state(), State::Init);
    assert!(rx_a.try_recv().is_err());

    master.set_profile(Profile::new(2, 1.0).with_max_rps(1));
    assert!(master.start().await.unwrap_err().is_config());

    master.set_profile(Profile::new(2, 1.0).with_loop_count(3).with_max_rps(2));
    master.start().await.unwrap();
    let share = expect_spawn(&mut rx_a);
    assert!((1..=2).contains(&share.loop_count));
    assert_eq!(share.max_rps, 1);
}

#[tokio::test(start_paused = true)]
async fn test_master_task_fetch_times_out() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(1, 1.0));
    attached_node(master.nodes(), "a");

    let err = master.start().await.unwrap_err();
    assert!(matches!(err, SwarmError::TaskFetchTimeout(_)));
    assert_eq!(master.state(), State::Init);
}

#[tokio::test]
async fn test_master_task_poller_gone() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(1, 1.0));
    attached_node(master.nodes(), "a");
    drop(master.take_task_requests());
    assert!(master.take_task_requests().is_none());

    let err = master.start().await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(master.state(), State::Init);
}

#[tokio::test]
async fn test_master_marks_silent_worker_missing() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(1, 1.0));
    let (a, _rx) = attached_node(master.nodes(), "a");

    master.check_heartbeats();
    master.check_heartbeats();
    assert_eq!(a.state(), State::Init);
    master.check_heartbeats();
    assert_eq!(a.state(), State::Missing);
    assert!(master.nodes().available().is_empty());

    a.beat(&heartbeat(State::Init, 0));
    assert_eq!(a.state(), State::Init);
    assert_eq!(master.nodes().available().len(), 1);
}

#[tokio::test]
async fn test_master_quit_broadcasts_and_shuts_down() {
    let master = MasterRunner::new(MasterConfig::default(), Profile::new(1, 1.0));
    let (_a, mut rx) = attached_node(master.nodes(), "a");
    let shutdown = master.shutdown_token();

    master.quit();
    assert_eq!(master.state(), State::Quitting);
    assert!(matches!(rx.try_recv(), Ok(Message::Quit)));
    assert!(shutdown.is_cancelled());

    master.quit();
    assert!(rx.try_recv().is_err());
}

//! Dispatch behavior: dedup, priority classes, starvation, cancellation.

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq as pretty_assert_eq;
use tfls_engine::{
    Filesystem, OpKind, OpState,
    exec::ExecutorOpts,
    path::ModulePath,
    registry::ModuleRegistry,
    scheduler::{OpContext, Parallelism, Scheduler},
    syntax::ConfigParser,
};
use tokio_util::sync::CancellationToken;

use crate::{BraceParser, Recorder, mock_discover, mock_executor_factory, test_engine_with, wait_until};

struct SchedulerHarness {
    fs: Filesystem,
    registry: ModuleRegistry,
    scheduler: Scheduler,
    recorder: Arc<Recorder>,
}

fn scheduler_harness(
    parallelism: Parallelism,
    slow_marker: Option<String>,
    delay: Duration,
) -> SchedulerHarness {
    let fs = Filesystem::new();
    let recorder = Arc::new(Recorder::default());
    let ctx = OpContext {
        fs: fs.clone(),
        parser: Arc::new(BraceParser::default()) as Arc<dyn ConfigParser>,
        executor_factory: mock_executor_factory(Arc::clone(&recorder), slow_marker, delay),
        executor_opts: ExecutorOpts::default(),
        discover: mock_discover(),
    };
    let scheduler = Scheduler::spawn(ctx, parallelism, CancellationToken::new());

    SchedulerHarness {
        fs: fs.clone(),
        registry: ModuleRegistry::new(fs),
        scheduler,
        recorder,
    }
}

#[test_log::test(tokio::test)]
async fn duplicate_enqueues_collapse() {
    // zero capacity in both classes keeps everything queued
    let harness = scheduler_harness(
        Parallelism { prio: 0, non_prio: 0 },
        None,
        Duration::ZERO,
    );
    let module = harness
        .registry
        .add(ModulePath::new("/w/mod"))
        .expect("add module");

    harness
        .scheduler
        .enqueue(Arc::clone(&module), OpKind::ParseConfiguration);
    harness
        .scheduler
        .enqueue(Arc::clone(&module), OpKind::ParseConfiguration);

    pretty_assert_eq!(harness.scheduler.queue_len(), 1);
    pretty_assert_eq!(module.parser_state(), OpState::Queued);

    // a different kind for the same module is its own entry
    harness
        .scheduler
        .enqueue(Arc::clone(&module), OpKind::GetVersion);
    pretty_assert_eq!(harness.scheduler.queue_len(), 2);

    // shutdown discards pending entries and resets their slots
    harness.scheduler.shutdown().await;
    pretty_assert_eq!(module.parser_state(), OpState::Unknown);
    pretty_assert_eq!(module.version_state(), OpState::Unknown);
}

#[test_log::test(tokio::test)]
async fn open_module_wins_the_only_slot() {
    let harness = test_engine_with(
        Parallelism { prio: 1, non_prio: 0 },
        None,
        Duration::ZERO,
    );

    let dir_a = tempfile::tempdir().expect("create temp dir");
    let dir_b = tempfile::tempdir().expect("create temp dir");
    std::fs::write(dir_a.path().join("main.tf"), "a {}\n").expect("write a");
    std::fs::write(dir_b.path().join("main.tf"), "b {}\n").expect("write b");

    // the user is editing a file in module A
    harness
        .fs
        .open_document(dir_a.path().join("main.tf"), "a {}\n", 1);

    let module_b = harness.engine.register(dir_b.path()).await.expect("register b");
    let module_a = harness.engine.register(dir_a.path()).await.expect("register a");

    wait_until("module A to finish", || {
        module_a.parser_state() == OpState::Loaded
            && module_a.version_state() == OpState::Loaded
            && module_a.schema_state() == OpState::Loaded
            && module_a.manifest_state() == OpState::Loaded
    })
    .await;

    // with no general capacity the closed module never advances
    pretty_assert_eq!(module_b.parser_state(), OpState::Queued);
    pretty_assert_eq!(module_b.version_state(), OpState::Queued);

    harness.engine.shutdown().await;
    pretty_assert_eq!(module_b.parser_state(), OpState::Unknown);
}

#[test_log::test(tokio::test)]
async fn classes_share_work_without_starving_either() {
    // one reserved slot, one general slot, every executor slow
    let harness = scheduler_harness(
        Parallelism { prio: 1, non_prio: 1 },
        None,
        Duration::from_millis(400),
    );

    let closed_1 = harness
        .registry
        .add(ModulePath::new("/w/closed-1"))
        .expect("add");
    let open = harness.registry.add(ModulePath::new("/w/open")).expect("add");
    let closed_2 = harness
        .registry
        .add(ModulePath::new("/w/closed-2"))
        .expect("add");
    harness.fs.open_document("/w/open/main.tf", "", 1);

    for module in [&closed_1, &open, &closed_2] {
        harness
            .scheduler
            .enqueue(Arc::clone(module), OpKind::GetVersion);
    }

    // the open module takes the reserved slot, the first closed module the
    // general slot; the second closed module must wait for a completion
    wait_until("two dispatches", || harness.recorder.version_calls() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pretty_assert_eq!(harness.recorder.version_calls(), 2);

    let mut first_two = harness.recorder.version_workdirs();
    first_two.sort();
    pretty_assert_eq!(
        first_two,
        vec![
            std::path::PathBuf::from("/w/closed-1"),
            std::path::PathBuf::from("/w/open"),
        ]
    );
    pretty_assert_eq!(closed_2.version_state(), OpState::Queued);

    wait_until("third dispatch", || harness.recorder.version_calls() == 3).await;
    wait_until("all loaded", || {
        [&closed_1, &open, &closed_2]
            .iter()
            .all(|m| m.version_state() == OpState::Loaded)
    })
    .await;

    harness.scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn closed_modules_progress_while_priority_slots_are_busy() {
    // the open module is slow and owns the reserved slot; the closed module
    // still completes through the general slot
    let harness = scheduler_harness(
        Parallelism { prio: 1, non_prio: 1 },
        Some("slow".to_string()),
        Duration::from_secs(2),
    );

    let open = harness
        .registry
        .add(ModulePath::new("/w/slow-open"))
        .expect("add");
    let closed = harness
        .registry
        .add(ModulePath::new("/w/closed"))
        .expect("add");
    harness.fs.open_document("/w/slow-open/main.tf", "", 1);

    harness.scheduler.enqueue(Arc::clone(&open), OpKind::GetVersion);
    harness
        .scheduler
        .enqueue(Arc::clone(&closed), OpKind::GetVersion);

    wait_until("closed module to finish", || {
        closed.version_state() == OpState::Loaded
    })
    .await;
    pretty_assert_eq!(open.version_state(), OpState::Loading);

    harness.scheduler.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn shutdown_leaves_no_slot_loading() {
    let harness = scheduler_harness(Parallelism::default(), None, Duration::from_secs(30));

    let mut modules = Vec::new();
    for path in ["/w/a", "/w/b", "/w/c"] {
        let module = harness.registry.add(ModulePath::new(path)).expect("add");
        harness
            .scheduler
            .enqueue(Arc::clone(&module), OpKind::GetVersion);
        harness
            .scheduler
            .enqueue(Arc::clone(&module), OpKind::ObtainSchema);
        modules.push(module);
    }

    wait_until("work in flight", || {
        modules
            .iter()
            .any(|m| m.version_state() == OpState::Loading)
    })
    .await;

    // drains in-flight workers; the slow executors observe cancellation
    harness.scheduler.shutdown().await;

    for module in &modules {
        for kind in OpKind::ALL {
            let state = module.op_state(kind);
            assert!(
                state == OpState::Loaded || state == OpState::Unknown,
                "slot {kind} of {} left at {state}",
                module.path()
            );
        }
    }

    // at least one in-flight operation recorded the interruption
    assert!(
        modules
            .iter()
            .any(|m| matches!(m.version_error(), Some(tfls_engine::EngineError::Cancelled))),
        "expected a cancelled in-flight operation"
    );
}

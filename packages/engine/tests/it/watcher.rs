//! Watcher plumbing: real filesystem events driving real enqueues.

use std::sync::atomic::Ordering;

use pretty_assertions::assert_eq as pretty_assert_eq;
use tfls_engine::{EngineError, OpState, scheduler::Parallelism};

use crate::{SAMPLE_MANIFEST, settle, test_engine, wait_until, write_atomic};

#[test_log::test(tokio::test)]
async fn config_writes_cause_exactly_one_reparse() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let main_tf = dir.path().join("main.tf");
    std::fs::write(&main_tf, "a {}\n").expect("write config");

    let harness = test_engine(Parallelism::default());
    let module = harness.engine.register(dir.path()).await.expect("register");

    wait_until("bootstrap parse", || module.parser_state() == OpState::Loaded).await;
    let baseline = harness.parser.calls.load(Ordering::SeqCst);

    // a byte-changing write triggers exactly one reparse
    write_atomic(&main_tf, "b {}\n");
    wait_until("reparse", || {
        harness.parser.calls.load(Ordering::SeqCst) == baseline + 1
    })
    .await;
    settle().await;
    pretty_assert_eq!(harness.parser.calls.load(Ordering::SeqCst), baseline + 1);

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn metadata_and_no_op_events_are_dropped() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let main_tf = dir.path().join("main.tf");
    std::fs::write(&main_tf, "a {}\n").expect("write config");

    let harness = test_engine(Parallelism::default());
    let module = harness.engine.register(dir.path()).await.expect("register");
    wait_until("bootstrap parse", || module.parser_state() == OpState::Loaded).await;
    let baseline = harness.parser.calls.load(Ordering::SeqCst);

    // permissions change: filtered by event kind
    let metadata = std::fs::metadata(&main_tf).expect("stat");
    let mut permissions = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(0o755);
    }
    std::fs::set_permissions(&main_tf, permissions).expect("chmod");
    settle().await;
    pretty_assert_eq!(harness.parser.calls.load(Ordering::SeqCst), baseline);

    // rewrite with identical bytes: filtered by content fingerprint
    write_atomic(&main_tf, "a {}\n");
    settle().await;
    pretty_assert_eq!(harness.parser.calls.load(Ordering::SeqCst), baseline);

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn manifest_creation_and_corruption_flow_through_the_watcher() {
    let dir = tempfile::tempdir().expect("create temp dir");
    // the datadir exists but holds no manifest yet
    let manifest_dir = dir.path().join(".terraform").join("modules");
    std::fs::create_dir_all(&manifest_dir).expect("create manifest dir");

    let harness = test_engine(Parallelism::default());
    let module = harness.engine.register(dir.path()).await.expect("register");

    wait_until("bootstrap manifest pass", || {
        module.manifest_state() == OpState::Loaded
    })
    .await;
    assert!(module.module_manifest().is_none());

    // the toolchain installs modules: the manifest appears
    write_atomic(&manifest_dir.join("modules.json"), SAMPLE_MANIFEST);
    wait_until("manifest to load", || {
        module
            .module_manifest()
            .is_some_and(|m| m.records().len() == 4)
    })
    .await;
    assert!(module.manifest_error().is_none());

    // the manifest is corrupted: the error is stored, the old manifest stays
    write_atomic(&manifest_dir.join("modules.json"), "definitely not json");
    wait_until("manifest error", || module.manifest_error().is_some()).await;
    pretty_assert_eq!(module.manifest_state(), OpState::Loaded);
    assert!(matches!(
        module.manifest_error(),
        Some(EngineError::Parse(_))
    ));
    assert!(
        module
            .module_manifest()
            .is_some_and(|m| m.records().len() == 4),
        "a failed reparse must not discard the previous manifest"
    );

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn plugin_lock_changes_requeue_version_and_schema() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let lock = dir.path().join(".terraform.lock.hcl");
    std::fs::write(&lock, "provider \"registry.terraform.io/hashicorp/aws\" {}\n")
        .expect("write lock");

    let harness = test_engine(Parallelism::default());
    let module = harness.engine.register(dir.path()).await.expect("register");

    wait_until("bootstrap version and schema", || {
        module.version_state() == OpState::Loaded && module.schema_state() == OpState::Loaded
    })
    .await;
    let version_baseline = harness.recorder.version_calls();
    let schema_baseline = harness.recorder.schema_calls();

    write_atomic(
        &lock,
        "provider \"registry.terraform.io/hashicorp/aws\" {\n  version = \"3.11.0\"\n}\n",
    );
    wait_until("version requery", || {
        harness.recorder.version_calls() == version_baseline + 1
    })
    .await;
    wait_until("schema requery", || {
        harness.recorder.schema_calls() == schema_baseline + 1
    })
    .await;
    settle().await;
    pretty_assert_eq!(harness.recorder.version_calls(), version_baseline + 1);
    pretty_assert_eq!(harness.recorder.schema_calls(), schema_baseline + 1);

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn events_for_unregistered_paths_are_ignored() {
    let registered = tempfile::tempdir().expect("create temp dir");
    let unregistered = tempfile::tempdir().expect("create temp dir");
    std::fs::write(registered.path().join("main.tf"), "a {}\n").expect("write config");

    let harness = test_engine(Parallelism::default());
    let module = harness
        .engine
        .register(registered.path())
        .await
        .expect("register");
    wait_until("bootstrap parse", || module.parser_state() == OpState::Loaded).await;
    let baseline = harness.parser.calls.load(Ordering::SeqCst);

    // nobody watches this directory; nothing may happen
    std::fs::write(unregistered.path().join("main.tf"), "x {}\n").expect("write config");
    settle().await;
    pretty_assert_eq!(harness.parser.calls.load(Ordering::SeqCst), baseline);

    harness.engine.shutdown().await;
}

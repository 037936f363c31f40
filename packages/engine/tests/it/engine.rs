//! End-to-end scenarios through the engine command surface.

use std::path::Path;

use pretty_assertions::assert_eq as pretty_assert_eq;
use tfls_engine::{EngineError, OpKind, OpState, scheduler::Parallelism};

use crate::{SAMPLE_MANIFEST, test_engine, wait_until, write_atomic};

fn stage_manifest(module_dir: &Path, contents: &str) {
    let manifest_dir = module_dir.join(".terraform").join("modules");
    std::fs::create_dir_all(&manifest_dir).expect("create manifest dir");
    std::fs::write(manifest_dir.join("modules.json"), contents).expect("write manifest");
}

#[test_log::test(tokio::test)]
async fn registration_loads_the_staged_manifest() {
    let dir = tempfile::tempdir().expect("create temp dir");
    stage_manifest(dir.path(), SAMPLE_MANIFEST);

    let harness = test_engine(Parallelism::default());
    let module = harness
        .engine
        .register(dir.path())
        .await
        .expect("register module");

    wait_until("manifest to load", || {
        module.manifest_state() == OpState::Loaded && module.module_manifest().is_some()
    })
    .await;

    let manifest = module.module_manifest().expect("manifest present");
    pretty_assert_eq!(manifest.records().len(), 4);
    assert!(manifest.references_module(&dir.path().join("nested").join("path")));
    assert!(module.calls_module(&dir.path().join("nested").join("path")));
    assert!(module.manifest_error().is_none());

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn registering_twice_is_rejected() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let harness = test_engine(Parallelism::default());

    harness
        .engine
        .register(dir.path())
        .await
        .expect("first registration");
    let err = harness
        .engine
        .register(dir.path())
        .await
        .expect_err("second registration must fail");
    assert!(matches!(err, EngineError::AlreadyRegistered(_)));

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn lookup_and_listing() {
    let dir_a = tempfile::tempdir().expect("create temp dir");
    let dir_b = tempfile::tempdir().expect("create temp dir");
    let harness = test_engine(Parallelism::default());

    harness.engine.register(dir_a.path()).await.expect("register a");
    harness.engine.register(dir_b.path()).await.expect("register b");

    let found = harness.engine.lookup(dir_a.path()).expect("lookup");
    pretty_assert_eq!(found.path().as_path(), dir_a.path());

    pretty_assert_eq!(harness.engine.list_modules().len(), 2);

    let err = harness
        .engine
        .lookup(Path::new("/nowhere"))
        .expect_err("unknown path");
    assert!(err.is_not_found());

    let err = harness
        .engine
        .enqueue_operation(Path::new("/nowhere"), OpKind::GetVersion)
        .expect_err("unknown path");
    assert!(err.is_not_found());

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn syntax_errors_surface_as_diagnostics_and_clear_on_fix() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let main_tf = dir.path().join("main.tf");
    std::fs::write(&main_tf, "resource \"aws_instance\" \"web\" {\n").expect("write config");

    let harness = test_engine(Parallelism::default());
    let module = harness.engine.register(dir.path()).await.expect("register");

    wait_until("first parse", || module.parser_state() == OpState::Loaded).await;
    let diags = module.diagnostics();
    assert!(
        !diags.get("main.tf").expect("diagnostics entry").is_empty(),
        "expected a syntax error for main.tf"
    );
    assert!(module.parsed_files().contains_key("main.tf"));

    write_atomic(&main_tf, "resource \"aws_instance\" \"web\" {}\n");
    wait_until("diagnostics to clear", || {
        module
            .diagnostics()
            .get("main.tf")
            .is_some_and(|d| d.is_empty())
    })
    .await;
    pretty_assert_eq!(module.parser_state(), OpState::Loaded);

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn missing_manifest_is_demoted_and_bad_manifest_is_stored() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let harness = test_engine(Parallelism::default());
    let module = harness.engine.register(dir.path()).await.expect("register");

    // no datadir at all: loaded, empty, no error
    wait_until("manifest pass", || module.manifest_state() == OpState::Loaded).await;
    assert!(module.module_manifest().is_none());
    assert!(module.manifest_error().is_none());
    assert!(module.module_calls().is_empty());

    stage_manifest(dir.path(), "definitely not json");
    harness
        .engine
        .enqueue_operation(dir.path(), OpKind::ParseModuleManifest)
        .expect("enqueue");

    wait_until("manifest error", || module.manifest_error().is_some()).await;
    pretty_assert_eq!(module.manifest_state(), OpState::Loaded);
    assert!(matches!(
        module.manifest_error(),
        Some(EngineError::Parse(_))
    ));

    harness.engine.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn bootstrap_populates_version_and_schema() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let harness = test_engine(Parallelism::default());
    let module = harness.engine.register(dir.path()).await.expect("register");

    wait_until("version and schema", || {
        module.version_state() == OpState::Loaded && module.schema_state() == OpState::Loaded
    })
    .await;

    pretty_assert_eq!(module.version(), Some(semver::Version::new(1, 6, 0)));
    pretty_assert_eq!(
        module
            .provider_versions()
            .get("registry.terraform.io/hashicorp/aws"),
        Some(&semver::Version::new(3, 10, 0))
    );
    assert!(module.provider_schemas().is_some());
    assert!(module.exec_path().is_some());

    harness.engine.shutdown().await;
}

//! Database-backed task state machine tests: the create/insert/retrieve
//! contract, forced initial state, lifecycle transitions, and the
//! output-existence rule in run_and_update.

mod common;

use common::TestProduction;
use specpipe_core::exec::{DryRunRunner, RecordingRunner};
use specpipe_core::state_machine::TaskState;
use specpipe_core::tasks::{
    PipelineTask, TaskContext, TaskDb, TaskProps, TaskRegistry, TaskValue,
};
use std::sync::Arc;

fn preproc_props(night: i64, expid: i64, camera: &str) -> TaskProps {
    let mut props = TaskProps::new();
    props.insert("night".to_string(), TaskValue::Int(night));
    props.insert("expid".to_string(), TaskValue::Int(expid));
    props.insert("camera".to_string(), TaskValue::Text(camera.to_string()));
    props
}

#[tokio::test]
async fn test_insert_forces_waiting_state() {
    let db = TaskDb::open_memory().await.unwrap();
    let registry = TaskRegistry::standard();
    registry.create_all(&db).await.unwrap();

    let task = registry.get("preproc").unwrap();
    let props = preproc_props(20210115, 42, "b0");
    task.insert(&db, &props).await.unwrap();

    let name = task.name_join(&props).unwrap();
    assert_eq!(task.state_get(&db, &name).await.unwrap(), TaskState::Waiting);

    // Re-inserting after a transition resets to waiting: newly scheduled
    // tasks always begin in a known state.
    task.state_set(&db, &name, TaskState::Done).await.unwrap();
    task.insert(&db, &props).await.unwrap();
    assert_eq!(task.state_get(&db, &name).await.unwrap(), TaskState::Waiting);
}

#[tokio::test]
async fn test_retrieve_round_trips_properties() {
    let db = TaskDb::open_memory().await.unwrap();
    let registry = TaskRegistry::standard();
    registry.create_all(&db).await.unwrap();

    let task = registry.get("extract").unwrap();
    let props = preproc_props(20210115, 7, "z3");
    task.insert(&db, &props).await.unwrap();

    let name = task.name_join(&props).unwrap();
    let record = task.retrieve(&db, &name).await.unwrap();
    assert_eq!(record.props, props);
    assert_eq!(record.state, TaskState::Waiting);
    assert_eq!(record.name, "extract_20210115_00000007_z3");
}

#[tokio::test]
async fn test_retrieve_missing_task_is_an_error() {
    let db = TaskDb::open_memory().await.unwrap();
    let registry = TaskRegistry::standard();
    registry.create_all(&db).await.unwrap();

    let task = registry.get("sky").unwrap();
    assert!(task
        .retrieve(&db, "sky_20210115_00000001_b0")
        .await
        .is_err());
    assert!(task
        .state_set(&db, "sky_20210115_00000001_b0", TaskState::Done)
        .await
        .is_err());
}

#[tokio::test]
async fn test_create_is_idempotent() {
    let db = TaskDb::open_memory().await.unwrap();
    let registry = TaskRegistry::standard();
    registry.create_all(&db).await.unwrap();
    registry.create_all(&db).await.unwrap();
}

#[tokio::test]
async fn test_bulk_state_set() {
    let db = TaskDb::open_memory().await.unwrap();
    let registry = TaskRegistry::standard();
    registry.create_all(&db).await.unwrap();

    let task = registry.get("preproc").unwrap();
    let mut names = Vec::new();
    for expid in 1..=5 {
        let props = preproc_props(20210115, expid, "b0");
        task.insert(&db, &props).await.unwrap();
        names.push(task.name_join(&props).unwrap());
    }
    let updated = db
        .bulk_state_set("preproc", &names[..3], TaskState::Running)
        .await
        .unwrap();
    assert_eq!(updated, 3);
    let running = db.names_in_state("preproc", TaskState::Running).await.unwrap();
    assert_eq!(running.len(), 3);
    let waiting = db.names_in_state("preproc", TaskState::Waiting).await.unwrap();
    assert_eq!(waiting.len(), 2);
}

#[tokio::test]
async fn test_run_and_update_done_only_when_outputs_exist() {
    let prod = TestProduction::new();
    let db = TaskDb::open_memory().await.unwrap();
    let registry = TaskRegistry::standard();
    registry.create_all(&db).await.unwrap();

    let task = registry.get("preproc").unwrap();
    let props = preproc_props(20210115, 42, "b0");
    task.insert(&db, &props).await.unwrap();
    let name = task.name_join(&props).unwrap();

    // raw input must exist for the command contract
    let raw = prod.paths.raw(20210115, 42);
    std::fs::create_dir_all(raw.parent().unwrap()).unwrap();
    std::fs::write(&raw, b"").unwrap();

    // The recording runner creates the declared outputs: zero failures and
    // outputs on disk means done.
    let ctx = TaskContext::new(prod.paths.clone(), Arc::new(RecordingRunner::new()));
    let failed = task
        .run_and_update(&db, &name, &serde_json::json!({}), &ctx)
        .await
        .unwrap();
    assert_eq!(failed, 0);
    assert_eq!(task.state_get(&db, &name).await.unwrap(), TaskState::Done);
}

#[tokio::test]
async fn test_run_and_update_fails_on_missing_outputs() {
    // A task whose execution "succeeds" without creating its declared
    // outputs must end up failed, not done: death without an error.
    let prod = TestProduction::new();
    let db = TaskDb::open_memory().await.unwrap();
    let registry = TaskRegistry::standard();
    registry.create_all(&db).await.unwrap();

    let task = registry.get("preproc").unwrap();
    let props = preproc_props(20210115, 43, "r1");
    task.insert(&db, &props).await.unwrap();
    let name = task.name_join(&props).unwrap();

    let raw = prod.paths.raw(20210115, 43);
    std::fs::create_dir_all(raw.parent().unwrap()).unwrap();
    std::fs::write(&raw, b"").unwrap();

    // DryRunRunner logs without touching outputs.
    let ctx = TaskContext::new(prod.paths.clone(), Arc::new(DryRunRunner));
    let failed = task
        .run_and_update(&db, &name, &serde_json::json!({}), &ctx)
        .await
        .unwrap();
    assert!(failed > 0);
    assert_eq!(task.state_get(&db, &name).await.unwrap(), TaskState::Fail);
}

#[tokio::test]
async fn test_run_converts_errors_to_failcount() {
    // Missing raw input makes the command contract fail; run() must
    // swallow the error and report a count instead of propagating.
    let prod = TestProduction::new();
    let registry = TaskRegistry::standard();
    let task = registry.get("preproc").unwrap();
    let props = preproc_props(20210115, 44, "z9");
    let name = task.name_join(&props).unwrap();

    let ctx = TaskContext::new(prod.paths.clone(), Arc::new(RecordingRunner::new()));
    let failed = task.run(&name, &serde_json::json!({}), &ctx).await;
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_base_defaults_fail_loudly() {
    use specpipe_core::tasks::NameField;

    struct UnfinishedTask;

    #[async_trait::async_trait]
    impl PipelineTask for UnfinishedTask {
        fn type_tag(&self) -> &'static str {
            "unfinished"
        }
        fn name_fields(&self) -> &[NameField] {
            const FIELDS: [NameField; 1] = [NameField::int("night", 8)];
            &FIELDS
        }
    }

    let prod = TestProduction::new();
    let task = UnfinishedTask;
    let mut props = TaskProps::new();
    props.insert("night".to_string(), TaskValue::Int(20210115));

    assert!(task.paths(&props, &prod.paths).is_err());
    assert!(task.deps(&props).is_err());
    assert!(task.run_max_procs(32).is_err());
    assert!(task.run_defaults().is_err());
    assert!(task
        .run_cli(&props, &serde_json::json!({}), &prod.paths)
        .is_err());

    // and a run over the unimplemented work function is a counted failure
    let ctx = TaskContext::new(prod.paths.clone(), Arc::new(RecordingRunner::new()));
    let failed = task.run("unfinished_20210115", &serde_json::json!({}), &ctx).await;
    assert_eq!(failed, 1);
}

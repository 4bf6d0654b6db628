use std::io::Write;
use std::sync::Arc;

use flowgraph_core::config::{ControllerKind, StoreKind};
use flowgraph_core::{FlowConfig, FlowError, TaskAction, TaskState};
use flowgraph_engine::{FlowEngine, GraphSpec, SimpleEvaluator};
use flowgraph_workflow::{StateKey, WorkflowService};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps = 500
event_capacity = 32

[workflow]
controller = "block"
actor_keys = ["role", "user"]

[store]
kind = "sqlite"
path = "/tmp/flowgraph-test/state.db"

[log]
filter = "flowgraph=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = FlowConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 500);
    assert_eq!(config.engine.event_capacity, 32);
    assert_eq!(config.workflow.controller, ControllerKind::Block);
    assert_eq!(config.workflow.actor_keys, vec!["role", "user"]);
    assert_eq!(config.store.kind, StoreKind::Sqlite);
    assert_eq!(
        config.store.resolved_path(),
        std::path::PathBuf::from("/tmp/flowgraph-test/state.db")
    );
    assert_eq!(config.log.filter, "flowgraph=debug");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWGRAPH_TEST_STORE_PATH", "/var/lib/flowgraph/state.db");

    let toml_content = r#"
[store]
kind = "sqlite"
path = "${FLOWGRAPH_TEST_STORE_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = FlowConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.store.path, "/var/lib/flowgraph/state.db");

    std::env::remove_var("FLOWGRAPH_TEST_STORE_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\n").expect("write toml");

    let config = FlowConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 10_000);
    assert_eq!(config.engine.event_capacity, 256);
    assert_eq!(config.workflow.controller, ControllerKind::Actor);
    assert_eq!(config.workflow.actor_keys, vec!["actor"]);
    assert_eq!(config.store.kind, StoreKind::Memory);
    assert_eq!(config.log.filter, "flowgraph=info,warn");
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = FlowConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, FlowError::ConfigNotFound(_)));
}

#[tokio::test]
async fn test_service_wired_from_config() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = dir.path().join("state").join("tasks.db");
    let toml_content = format!(
        r#"
[workflow]
controller = "actor"
actor_keys = ["role"]

[store]
kind = "sqlite"
path = "{}"
"#,
        db.display()
    );
    let config = FlowConfig::parse(&toml_content).expect("parse config");

    let mut spec = GraphSpec::new("expense");
    spec.add_start("s").link_to("approve");
    spec.add_activity("approve")
        .meta_put("role", "manager")
        .link_to("e");
    spec.add_end("e");

    let engine = Arc::new(
        FlowEngine::new(Arc::new(SimpleEvaluator)).with_config(config.engine.clone()),
    );
    engine.load(spec.build().expect("valid graph"));
    let service = WorkflowService::from_config(engine.clone(), &config).expect("open service");

    let mut ctx = engine.new_context("claim-7");
    ctx.put("role", "manager");
    let task = service
        .get_task("expense", &mut ctx)
        .await
        .expect("query")
        .expect("a task");
    assert_eq!(task.node_id, "approve");
    service
        .post_task("expense", "approve", TaskAction::Forward, &mut ctx)
        .await
        .expect("forward");

    assert!(db.exists());
    assert_eq!(
        service
            .repository()
            .state_get(&StateKey::new("claim-7", "expense", "approve"))
            .expect("read state"),
        TaskState::Completed
    );
    assert!(service.get_task("expense", &mut ctx).await.expect("query").is_none());
}

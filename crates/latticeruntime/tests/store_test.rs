use latticecore::{
    Connection, EventBus, LogLevel, LogSink, NodeRunResult, NodeSpec, NodeStatus, Value,
};
use latticeruntime::expr::Lookup;
use latticeruntime::{EdgeState, ExecutionContext, StateStore, VariableScope};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn create_store() -> Arc<StateStore> {
    let bus = EventBus::new(64);
    Arc::new(StateStore::new(Uuid::new_v4(), bus.sender()))
}

fn connection(from: &NodeSpec, to: &NodeSpec) -> Connection {
    Connection {
        from_node: from.id,
        from_port: "value".to_string(),
        to_node: to.id,
        to_port: "value".to_string(),
    }
}

#[test]
fn test_edge_state_is_derived_from_endpoints() {
    let store = create_store();
    let a = NodeSpec::new("test.echo");
    let b = NodeSpec::new("test.echo");
    store.register(&a, NodeStatus::Pending);
    store.register(&b, NodeStatus::Pending);
    let edge = connection(&a, &b);

    assert_eq!(store.edge_state(&edge), EdgeState::Idle);
    store.set_status(a.id, NodeStatus::Running);
    assert_eq!(store.edge_state(&edge), EdgeState::UpstreamRunning);
    store.set_status(a.id, NodeStatus::Success);
    store.set_status(b.id, NodeStatus::Running);
    assert_eq!(store.edge_state(&edge), EdgeState::DownstreamRunning);
    store.set_status(b.id, NodeStatus::Success);
    assert_eq!(store.edge_state(&edge), EdgeState::Idle);
}

#[test]
fn test_snapshot_keeps_registration_order_and_results() {
    let store = create_store();
    let first = NodeSpec::new("test.echo").with_name("first");
    let second = NodeSpec::new("test.echo").with_name("second");
    store.register(&first, NodeStatus::Pending);
    store.register(&second, NodeStatus::Idle);
    store.append_log(first.id, LogLevel::Info, "hello");
    let mut outputs = BTreeMap::new();
    outputs.insert("value".to_string(), Value::from(1i64));
    store.record_result(first.id, NodeRunResult::succeeded(outputs, 3));
    store.set_status(first.id, NodeStatus::Success);

    let snapshot = store.snapshot();

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].name.as_deref(), Some("first"));
    assert_eq!(snapshot[0].status, NodeStatus::Success);
    assert_eq!(snapshot[0].logs[0].message, "hello");
    assert!(snapshot[0].result.as_ref().unwrap().success);
    assert_eq!(snapshot[1].status, NodeStatus::Idle);
    assert!(snapshot[1].result.is_none());
}

#[test]
fn test_logs_since_returns_only_new_lines() {
    let store = create_store();
    let node = NodeSpec::new("test.echo");
    store.register(&node, NodeStatus::Pending);
    store.append(node.id, LogLevel::Info, "one".to_string());
    let mark = store.log_len(node.id);
    store.append(node.id, LogLevel::Warn, "two".to_string());

    let lines = store.logs_since(node.id, mark);

    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].message, "two");
    assert_eq!(lines[0].level, LogLevel::Warn);
    assert_eq!(store.logs(node.id).len(), 2);
}

#[test]
fn test_outputs_are_bound_once_per_scope_level() {
    let scope = VariableScope::new(BTreeMap::new(), BTreeMap::new());
    let node = NodeSpec::new("test.echo").with_name("Load Data");
    let mut outputs = BTreeMap::new();
    outputs.insert("rows".to_string(), Value::from(3i64));

    assert!(scope.bind_outputs(&node, &outputs));
    assert!(!scope.bind_outputs(&node, &outputs), "second bind must be refused");

    let record = scope.node_outputs("Load_Data").unwrap();
    assert_eq!(record.as_object().unwrap().get("rows"), Some(&Value::Number(3.0)));
    assert_eq!(scope.node_outputs(&node.id.to_string()), Some(record));

    // a pass overlay gets a fresh level but still sees the parent
    let pass = scope.overlay([("index".to_string(), Value::from(0i64))]);
    assert!(pass.bind_outputs(&node, &outputs));
    assert!(pass.lookup("Load_Data").is_some());
    assert_eq!(pass.lookup("index"), Some(Value::Number(0.0)));
    assert_eq!(scope.lookup("index"), None);
}

#[test]
fn test_name_precedence() {
    let mut environment = BTreeMap::new();
    environment.insert("shared".to_string(), Value::from("env"));
    let mut custom = BTreeMap::new();
    custom.insert("shared".to_string(), Value::from("custom"));
    custom.insert("only_custom".to_string(), Value::from("c"));
    let scope = VariableScope::new(environment, custom);

    assert_eq!(scope.lookup("shared"), Some(Value::from("env")));
    assert_eq!(scope.lookup("only_custom"), Some(Value::from("c")));

    let local = scope.with_locals([("shared".to_string(), Value::from("local"))]);
    assert_eq!(local.lookup("shared"), Some(Value::from("local")));
    let env_record = local.lookup("env").unwrap();
    assert_eq!(env_record.as_object().unwrap().get("shared"), Some(&Value::from("env")));
}

#[test]
fn test_scope_guard_releases_overlay_on_drop() {
    let scope = VariableScope::new(BTreeMap::new(), BTreeMap::new());
    let ctx = ExecutionContext::new(Uuid::new_v4(), scope.clone(), create_store(), CancellationToken::new());
    let node = Uuid::new_v4();
    let mut env = BTreeMap::new();
    env.insert("MODE".to_string(), "fast".to_string());

    {
        let guard = ctx.acquire(node, env.clone());
        assert_eq!(ctx.active_overlay(node), Some(env));
        let visible = guard.scope(&scope).lookup("env").unwrap();
        assert_eq!(visible.as_object().unwrap().get("MODE"), Some(&Value::from("fast")));
        assert_eq!(scope.lookup("env"), Some(Value::Object(BTreeMap::new())));
    }

    assert_eq!(ctx.active_overlays(), 0);
    assert_eq!(ctx.active_overlay(node), None);
}

#[test]
fn test_scope_guard_releases_overlay_on_panic() {
    let scope = VariableScope::new(BTreeMap::new(), BTreeMap::new());
    let ctx = ExecutionContext::new(Uuid::new_v4(), scope, create_store(), CancellationToken::new());
    let node = Uuid::new_v4();

    let held = ctx.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let _guard = held.acquire(node, BTreeMap::new());
        panic!("component failed");
    }));

    assert!(outcome.is_err());
    assert_eq!(ctx.active_overlays(), 0);
}

#[test]
fn test_custom_values_update_in_place() {
    let scope = VariableScope::new(BTreeMap::new(), BTreeMap::new());
    let copy = scope.clone();

    scope.set_custom("threshold", Value::from(5i64));

    assert_eq!(copy.custom("threshold"), Some(Value::Number(5.0)));
    assert_eq!(copy.lookup("threshold"), Some(Value::Number(5.0)));
}

use latticecore::{
    Component, ComponentContext, DataKind, EventBus, FlowError, NodeError, NodeSpec, NodeStatus,
    ValidationError, Value, Workflow,
};
use latticenodes::{
    register_all, DebugNode, DelayNode, HttpRequestNode, InputNode, JsonParseNode,
    JsonStringifyNode, ScriptNode,
};
use latticeruntime::{ComponentRegistry, FlowRuntime, RunInputs, RuntimeConfig};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

fn create_context() -> ComponentContext {
    let bus = EventBus::new(64);
    ComponentContext::new(Uuid::new_v4(), bus.create_emitter(Uuid::new_v4(), Uuid::new_v4()))
}

fn create_runtime() -> FlowRuntime {
    let registry = Arc::new(ComponentRegistry::new());
    register_all(&registry);
    FlowRuntime::with_registry(registry, RuntimeConfig::default())
}

#[test]
fn test_register_all_covers_every_component() {
    let registry = ComponentRegistry::new();
    register_all(&registry);

    assert_eq!(
        registry.list_types(),
        vec![
            "debug.log",
            "http.request",
            "input.value",
            "script.run",
            "time.delay",
            "transform.json_parse",
            "transform.json_stringify",
        ]
    );
}

#[tokio::test]
async fn test_input_prefers_bound_value() {
    let mut ctx = create_context();
    ctx.properties.insert("value".to_string(), Value::from("default"));

    let output = InputNode.run(ctx.clone()).await.unwrap();
    assert_eq!(output.outputs["value"], Value::from("default"));

    ctx.inputs.insert("value".to_string(), Value::from("bound"));
    let output = InputNode.run(ctx).await.unwrap();
    assert_eq!(output.outputs["value"], Value::from("bound"));
}

#[tokio::test]
async fn test_debug_passes_value_through() {
    let mut ctx = create_context();
    ctx.inputs.insert("value".to_string(), Value::from(7i64));

    let output = DebugNode.run(ctx).await.unwrap();

    assert_eq!(output.outputs["message"], Value::from("(no message)"));
    assert_eq!(output.outputs["value"], Value::Number(7.0));
}

#[tokio::test]
async fn test_json_parse_and_stringify() {
    let mut ctx = create_context();
    ctx.inputs.insert("json".to_string(), Value::from(r#"{"a": [1, true]}"#));
    let parsed = JsonParseNode.run(ctx).await.unwrap().outputs["parsed"].clone();
    assert_eq!(parsed.as_object().unwrap()["a"].as_array().unwrap().len(), 2);

    let mut ctx = create_context();
    ctx.inputs.insert("value".to_string(), parsed);
    let output = JsonStringifyNode.run(ctx).await.unwrap();
    assert_eq!(output.outputs["json"], Value::from(r#"{"a":[1.0,true]}"#));
}

#[tokio::test]
async fn test_json_parse_rejects_non_text() {
    let mut ctx = create_context();
    ctx.inputs.insert("json".to_string(), Value::from(1i64));

    let err = JsonParseNode.run(ctx).await.unwrap_err();

    assert!(matches!(err, NodeError::InvalidInputType { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_delay_stops_on_cancellation() {
    let mut ctx = create_context();
    ctx.properties.insert("delay_ms".to_string(), Value::from(10_000.0));
    ctx.cancellation.cancel();

    let err = DelayNode.run(ctx).await.unwrap_err();

    assert_eq!(err, NodeError::Cancelled);
}

#[tokio::test]
async fn test_delay_rejects_negative_duration() {
    let mut ctx = create_context();
    ctx.properties.insert("delay_ms".to_string(), Value::from(-5.0));

    let err = DelayNode.run(ctx).await.unwrap_err();

    assert!(matches!(err, NodeError::Configuration(_)));
}

#[tokio::test]
async fn test_http_requires_url_and_known_method() {
    let node = HttpRequestNode::new();
    let err = node.run(create_context()).await.unwrap_err();
    assert_eq!(err, NodeError::MissingInput("url".to_string()));

    let mut ctx = create_context();
    ctx.properties.insert("url".to_string(), Value::from("http://127.0.0.1:9"));
    ctx.properties.insert("method".to_string(), Value::from("TRACE"));
    let err = node.run(ctx).await.unwrap_err();
    assert!(matches!(err, NodeError::Configuration(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_http_request_against_local_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
    });

    let mut ctx = create_context();
    ctx.inputs.insert("url".to_string(), Value::from(format!("http://{}/ping", addr)));
    let output = HttpRequestNode::new().run(ctx).await.unwrap();

    assert_eq!(output.outputs["status"], Value::Number(200.0));
    assert_eq!(output.outputs["body"], Value::from("hello"));
    let headers = output.outputs["headers"].as_object().unwrap();
    assert_eq!(headers.get("x-test"), Some(&Value::from("yes")));
}

#[cfg(unix)]
#[tokio::test]
async fn test_script_runs_with_chosen_interpreter() {
    let mut ctx = create_context();
    ctx.properties.insert("interpreter".to_string(), Value::from("sh"));
    ctx.properties.insert(
        "code".to_string(),
        Value::from(r#"printf '{"output": "from script"}' > "$LATTICE_RESULT_PATH""#),
    );

    let output = ScriptNode::default().run(ctx).await.unwrap();

    assert_eq!(output.outputs["output"], Value::from("from script"));
}

#[tokio::test]
async fn test_script_requires_code() {
    let err = ScriptNode::new("sh").run(create_context()).await.unwrap_err();

    assert!(matches!(err, NodeError::Configuration(_)));
}

#[tokio::test]
async fn test_standard_nodes_in_a_workflow() {
    let runtime = create_runtime();
    let mut wf = Workflow::new("standard");
    let input = wf.add_node(
        NodeSpec::new("input.value")
            .with_name("answer")
            .with_output("value", DataKind::Any)
            .with_property("value", 42.0),
    );
    let debug = wf.add_node(
        NodeSpec::new("debug.log")
            .with_name("show")
            .with_input("value", DataKind::Any)
            .with_output("value", DataKind::Any)
            .with_property("message", "answer is $answer.value$"),
    );
    wf.connect(input, "value", debug, "value");

    let report = runtime.execute(&wf, RunInputs::new()).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.status_of(debug), Some(NodeStatus::Success));
    assert_eq!(report.output(debug, "value"), Some(&Value::Number(42.0)));
    let logs = &report.node(debug).unwrap().logs;
    assert!(
        logs.iter().any(|l| l.message == "DEBUG: answer is 42"),
        "logs: {:?}",
        logs
    );
}

#[test]
fn test_literal_misconfiguration_is_caught_before_the_run() {
    let runtime = create_runtime();
    let mut wf = Workflow::new("misconfigured");
    let delay = wf.add_node(NodeSpec::new("time.delay").with_property("delay_ms", -5.0));
    let http = wf.add_node(
        NodeSpec::new("http.request")
            .with_property("url", "http://127.0.0.1:9")
            .with_property("method", "TRACE"),
    );
    wf.add_node(NodeSpec::new("http.request").with_property("method", "$verb$"));

    let errors = match runtime.validate(&wf) {
        Err(FlowError::Validation(errors)) => errors,
        other => panic!("expected validation errors, got {:?}", other),
    };

    let flagged: Vec<_> = errors
        .iter()
        .filter_map(|e| match e {
            ValidationError::InvalidConfig { node_id, .. } => Some(*node_id),
            _ => None,
        })
        .collect();
    assert_eq!(flagged, vec![delay, http], "expressions are left for run time");
}

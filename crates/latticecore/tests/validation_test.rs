use latticecore::{
    topological_order, validate, validate_with, DataKind, LoopMode, NodeSpec, SubGraph,
    ValidationError, Workflow,
};

fn passthrough(name: &str) -> NodeSpec {
    NodeSpec::new("debug.log")
        .with_name(name)
        .with_input("input", DataKind::Any)
        .with_output("output", DataKind::Any)
}

#[test]
fn test_diamond_orders_by_level_then_insertion() {
    let mut wf = Workflow::new("diamond");
    let d = wf.add_node(passthrough("d"));
    let c = wf.add_node(passthrough("c"));
    let b = wf.add_node(passthrough("b"));
    let a = wf.add_node(passthrough("a"));
    wf.connect(a, "output", b, "input");
    wf.connect(a, "output", c, "input");
    wf.connect(b, "output", d, "input");
    // d has a single input port, so feed c into a second port
    wf.nodes[0].inputs.push(latticecore::PortSpec::new("other", DataKind::Any));
    wf.connect(c, "output", d, "other");

    assert!(validate(wf.graph()).is_empty());
    let order = topological_order(wf.graph()).unwrap();
    assert_eq!(order, vec![a, c, b, d]);

    // Same graph, same order, every time
    for _ in 0..10 {
        assert_eq!(topological_order(wf.graph()).unwrap(), order);
    }
}

#[test]
fn test_node_waits_for_its_deepest_dependency() {
    let mut wf = Workflow::new("depth");
    let a = wf.add_node(passthrough("a"));
    let b = wf.add_node(passthrough("b"));
    let c = wf.add_node(
        passthrough("c").with_input("extra", DataKind::Any),
    );
    let e = wf.add_node(passthrough("e"));
    wf.connect(a, "output", b, "input");
    wf.connect(b, "output", c, "input");
    wf.connect(a, "output", c, "extra");

    let order = topological_order(wf.graph()).unwrap();
    assert_eq!(order, vec![a, e, b, c]);
}

#[test]
fn test_cycle_is_rejected() {
    let mut wf = Workflow::new("cycle");
    let a = wf.add_node(passthrough("a"));
    let b = wf.add_node(passthrough("b"));
    let tail = wf.add_node(passthrough("tail"));
    wf.connect(a, "output", b, "input");
    wf.connect(b, "output", a, "input");
    wf.connect(tail, "output", tail, "input");

    match topological_order(wf.graph()) {
        Err(ValidationError::Cycle { nodes }) => assert_eq!(nodes, vec![a, b, tail]),
        other => panic!("expected cycle, got {:?}", other),
    }
    assert!(validate(wf.graph())
        .iter()
        .any(|e| matches!(e, ValidationError::Cycle { .. })));
}

#[test]
fn test_fan_in_on_one_input_is_rejected() {
    let mut wf = Workflow::new("fan-in");
    let a = wf.add_node(passthrough("a"));
    let b = wf.add_node(passthrough("b"));
    let c = wf.add_node(passthrough("c"));
    wf.connect(a, "output", c, "input");
    wf.connect(b, "output", c, "input");

    let errors = validate(wf.graph());
    assert_eq!(
        errors,
        vec![ValidationError::FanIn {
            node_id: c,
            port: "input".to_string()
        }]
    );
}

#[test]
fn test_incompatible_kinds_are_rejected() {
    let mut wf = Workflow::new("kinds");
    let text = wf.add_node(NodeSpec::new("input.value").with_output("value", DataKind::Text));
    let csv = wf.add_node(NodeSpec::new("input.value").with_output("value", DataKind::Csv));
    let num = wf.add_node(NodeSpec::new("debug.log").with_input("input", DataKind::Number));
    let file = wf.add_node(NodeSpec::new("debug.log").with_input("input", DataKind::File));
    wf.connect(text, "value", num, "input");
    wf.connect(csv, "value", file, "input");

    let errors = validate(wf.graph());
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ValidationError::IncompatibleKinds { source_kind: DataKind::Text, target_kind: DataKind::Number, .. }
    ));
}

#[test]
fn test_file_does_not_flow_into_csv() {
    assert!(DataKind::Csv.flows_into(&DataKind::File));
    assert!(!DataKind::File.flows_into(&DataKind::Csv));
    assert!(DataKind::Any.flows_into(&DataKind::Record));
    assert!(DataKind::List.flows_into(&DataKind::Any));
    assert!(!DataKind::Unknown("blob".into()).flows_into(&DataKind::Any));
}

#[test]
fn test_undeclared_kind_is_rejected() {
    let mut wf = Workflow::new("undeclared");
    wf.add_node(NodeSpec::new("debug.log").with_input("input", DataKind::from("blob".to_string())));

    let errors = validate(wf.graph());
    assert!(matches!(
        &errors[0],
        ValidationError::UndeclaredDataKind { kind, .. } if kind == "blob"
    ));
}

#[test]
fn test_dangling_and_reversed_connections() {
    let mut wf = Workflow::new("dangling");
    let a = wf.add_node(passthrough("a"));
    let b = wf.add_node(passthrough("b"));
    let ghost = uuid::Uuid::new_v4();
    wf.connect(a, "output", ghost, "input");
    wf.connect(a, "missing", b, "input");
    wf.connect(a, "input", b, "input");

    let errors = validate(wf.graph());
    assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownNode { node_id, .. } if *node_id == ghost)));
    assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownPort { port, .. } if port == "missing")));
    assert!(errors.iter().any(|e| matches!(e, ValidationError::DirectionMismatch { .. })));
}

#[test]
fn test_duplicate_ids_and_ports() {
    let mut wf = Workflow::new("dupes");
    let a = passthrough("a").with_output("output", DataKind::Text);
    let copy = a.clone();
    wf.add_node(a);
    wf.add_node(copy);

    let errors = validate(wf.graph());
    assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicateNode { .. })));
    assert!(errors.iter().any(|e| matches!(e, ValidationError::DuplicatePort { port, .. } if port == "output")));
}

#[test]
fn test_unknown_component_type() {
    let mut wf = Workflow::new("types");
    wf.add_node(NodeSpec::new("nope.nothing"));
    wf.add_node(NodeSpec::branch([("yes", "$true$")]));

    let errors = validate_with(wf.graph(), &|t| t == "debug.log");
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        ValidationError::UnknownNodeType { node_type, .. } if node_type == "nope.nothing"
    ));
}

#[test]
fn test_nested_body_is_validated() {
    let mut body = SubGraph::new();
    let x = body.add_node(passthrough("x"));
    let y = body.add_node(passthrough("y"));
    body.connect(x, "output", y, "input");
    body.connect(y, "output", x, "input");
    let body = body.with_entry(x, "input").with_exit(y, "output");

    let mut wf = Workflow::new("nested");
    wf.add_node(NodeSpec::bounded_loop(LoopMode::Count { times: 2 }, 0, body));

    let errors = validate(wf.graph());
    assert!(errors.iter().any(|e| matches!(e, ValidationError::Cycle { .. })));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ValidationError::InvalidControlFlow { .. })));
}

#[test]
fn test_graph_document_round_trip() {
    let mut body = SubGraph::new();
    let step = body.add_node(passthrough("step").with_property("factor", 2.0));
    let body = body.with_entry(step, "input").with_exit(step, "output");

    let mut wf = Workflow::new("persisted");
    let source = wf.add_node(
        NodeSpec::new("input.value")
            .with_name("source")
            .with_property("value", "$custom.seed$")
            .with_output("value", DataKind::List)
            .expose("value")
            .with_position(10.0, 20.0),
    );
    let each = wf.add_node(NodeSpec::iterate(body));
    wf.connect(source, "value", each, "items");

    let json = serde_json::to_string_pretty(&wf).unwrap();
    let restored: Workflow = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, wf);
    assert!(json.contains("\"$custom.seed$\""));
}

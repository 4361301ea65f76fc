mod common;

use async_trait::async_trait;
use common::{create_runtime, node, NeedsPackage};
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, NodeSpec,
    PropertyDefinition, Value, Workflow,
};
use latticeruntime::{export, infer_interface, Bundle, ExportError, RunInputs};
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use uuid::Uuid;

/// source -> first -> second -> sink
fn pipeline() -> (Workflow, [Uuid; 4]) {
    let mut wf = Workflow::new("pipeline");
    let source = wf.add_node(node("test.echo", "source").with_property("value", 1.0));
    let first = wf.add_node(node("test.add", "first").with_property("amount", 10.0));
    let second = wf.add_node(node("test.add", "second").with_property("amount", 100.0));
    let sink = wf.add_node(node("test.echo", "sink"));
    wf.connect(source, "value", first, "value");
    wf.connect(first, "value", second, "value");
    wf.connect(second, "value", sink, "value");
    (wf, [source, first, second, sink])
}

#[test]
fn test_interface_follows_the_selection_boundary() {
    let (wf, [_, first, second, _]) = pipeline();
    let selected = HashSet::from([first, second]);

    let spec = infer_interface(&wf, &selected).unwrap();

    let inputs: Vec<&str> = spec.inputs.iter().map(|p| p.name.as_str()).collect();
    let outputs: Vec<&str> = spec.outputs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(inputs, vec!["first_value"]);
    assert_eq!(outputs, vec!["second_value"]);
    assert_eq!(spec.input("first_value").unwrap().node, first);
    assert_eq!(spec.output("second_value").unwrap().kind, DataKind::Any);
}

#[test]
fn test_exposed_ports_join_the_interface() {
    let mut wf = Workflow::new("exposed");
    let lonely = wf.add_node(
        node("test.add", "lonely")
            .with_input("extra", DataKind::Number)
            .expose("extra"),
    );
    let selected = HashSet::from([lonely]);

    let spec = infer_interface(&wf, &selected).unwrap();

    let inputs: Vec<&str> = spec.inputs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(inputs, vec!["lonely_extra"], "unconnected ports stay internal unless exposed");
    assert_eq!(spec.outputs.len(), 1);
}

#[test]
fn test_interface_names_are_made_unique() {
    let mut wf = Workflow::new("collide");
    let feed = wf.add_node(node("test.echo", "feed"));
    let left = wf.add_node(node("test.add", "step"));
    let right = wf.add_node(node("test.add", "step"));
    wf.connect(feed, "value", left, "value");
    wf.connect(feed, "value", right, "value");
    let selected = HashSet::from([left, right]);

    let spec = infer_interface(&wf, &selected).unwrap();

    let inputs: Vec<&str> = spec.inputs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(inputs, vec!["step_value", "step_value_2"]);
    let outputs: Vec<&str> = spec.outputs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(outputs, vec!["step_value", "step_value_2"]);
}

#[test]
fn test_invalid_selections_are_rejected() {
    let (wf, _) = pipeline();

    assert!(matches!(
        infer_interface(&wf, &HashSet::new()),
        Err(ExportError::EmptySelection)
    ));
    let stranger = Uuid::new_v4();
    assert!(matches!(
        infer_interface(&wf, &HashSet::from([stranger])),
        Err(ExportError::UnknownNode(id)) if id == stranger
    ));
}

#[tokio::test]
async fn test_bundle_round_trip_runs_with_interface_values() {
    let runtime = create_runtime();
    let (wf, [_, first, second, _]) = pipeline();
    let dir = tempfile::tempdir().unwrap();

    let spec = export(&wf, &HashSet::from([first, second]), runtime.registry(), dir.path()).unwrap();
    let bundle = Bundle::load(dir.path()).unwrap();

    assert_eq!(bundle.interface, spec);
    assert_eq!(bundle.workflow.nodes.len(), 2);
    assert_eq!(bundle.workflow.connections.len(), 1, "only internal edges are kept");
    assert!(bundle.workflow.find_node(first).is_some(), "node ids are preserved");
    assert!(dir.path().join("README.md").is_file());

    let mut inputs = RunInputs::new();
    inputs.interface.insert("first_value".to_string(), Value::from(5.0));
    let inputs = inputs.bind_interface(&bundle.interface).unwrap();
    let report = runtime.execute(&bundle.workflow, inputs).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.output(second, "value"), Some(&Value::Number(115.0)));
}

#[test]
fn test_unknown_interface_input_is_rejected() {
    let (wf, [_, first, second, _]) = pipeline();
    let spec = infer_interface(&wf, &HashSet::from([first, second])).unwrap();

    let mut inputs = RunInputs::new();
    inputs.interface.insert("nope".to_string(), Value::from(1.0));

    assert!(matches!(
        inputs.bind_interface(&spec),
        Err(ExportError::UnknownInput(name)) if name == "nope"
    ));
}

#[test]
fn test_file_properties_are_copied_and_rewritten() {
    let runtime = create_runtime();
    let data_dir = tempfile::tempdir().unwrap();
    let data = data_dir.path().join("data.csv");
    std::fs::write(&data, "a,b\n1,2\n").unwrap();

    let mut wf = Workflow::new("files");
    let loader = wf.add_node(
        node("test.echo", "loader").with_property("path", data.to_string_lossy().into_owned()),
    );
    let out = tempfile::tempdir().unwrap();

    let spec = export(&wf, &HashSet::from([loader]), runtime.registry(), out.path()).unwrap();

    let copied = out.path().join("inputs").join("loader_data.csv");
    assert_eq!(std::fs::read_to_string(&copied).unwrap(), "a,b\n1,2\n");
    assert!(spec.files.contains(&std::path::PathBuf::from("inputs/loader_data.csv")));

    let written = std::fs::read_to_string(out.path().join("workflow.json")).unwrap();
    assert!(written.contains("\"inputs/loader_data.csv\""), "workflow.json: {}", written);
    assert!(!written.contains(&*data.to_string_lossy()));

    let bundle = Bundle::load(out.path()).unwrap();
    let path = bundle.workflow.nodes[0].properties["path"].as_str().unwrap().to_string();
    assert_eq!(std::path::PathBuf::from(path), copied);
}

#[test]
fn test_requirements_are_consolidated() {
    let runtime = create_runtime();
    runtime.registry().register(Arc::new(NeedsPackage {
        missing: 0,
        requirements: "numpy>=1.20".to_string(),
        calls: Arc::new(AtomicUsize::new(0)),
    }));
    let mut wf = Workflow::new("reqs");
    let needs = wf.add_node(NodeSpec::new("test.needs").with_output("value", DataKind::Text));
    let custom = wf.add_node(node("test.echo", "custom").with_property("requirements", "pandas, NumPy<2"));
    let out = tempfile::tempdir().unwrap();

    export(&wf, &HashSet::from([needs, custom]), runtime.registry(), out.path()).unwrap();
    let bundle = Bundle::load(out.path()).unwrap();

    assert_eq!(bundle.requirements(), "numpy>=1.20,<2\npandas\n");
}

#[test]
fn test_process_component_files_are_bundled() {
    let runtime = create_runtime();
    let components = tempfile::tempdir().unwrap();
    std::fs::write(
        components.path().join("shout.component.json"),
        r#"{"type": "demo.shout", "command": ["sh"], "script": "shout.sh"}"#,
    )
    .unwrap();
    std::fs::write(components.path().join("shout.sh"), "echo hi\n").unwrap();
    assert_eq!(runtime.registry().scan_dir(components.path()).unwrap(), 1);

    let mut wf = Workflow::new("process");
    let shout = wf.add_node(NodeSpec::new("demo.shout"));
    let out = tempfile::tempdir().unwrap();

    let spec = export(&wf, &HashSet::from([shout]), runtime.registry(), out.path()).unwrap();

    assert!(out.path().join("components/shout.component.json").is_file());
    assert!(out.path().join("components/shout.sh").is_file());
    assert_eq!(spec.files.len(), 2);
    let readme = std::fs::read_to_string(out.path().join("README.md")).unwrap();
    assert!(!readme.contains("demo.shout"), "process components are shipped, not listed as built-in");
}

/// Declares `dataset` as a folder; `workdir` is plain text
struct DatasetReader;

#[async_trait]
impl Component for DatasetReader {
    fn component_type(&self) -> &str {
        "test.dataset"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            properties: vec![
                PropertyDefinition::new("dataset", DataKind::Folder),
                PropertyDefinition::new("workdir", DataKind::Text),
            ],
            ..ComponentMetadata::default()
        }
    }

    async fn run(&self, _ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new())
    }
}

#[test]
fn test_only_declared_folders_are_copied() {
    let runtime = create_runtime();
    runtime.registry().register(Arc::new(DatasetReader));
    let dataset = tempfile::tempdir().unwrap();
    std::fs::write(dataset.path().join("rows.csv"), "a\n1\n").unwrap();
    let scratch = tempfile::tempdir().unwrap();
    std::fs::write(scratch.path().join("big.bin"), "not for the bundle").unwrap();
    let scratch_path = scratch.path().to_string_lossy().into_owned();

    let mut wf = Workflow::new("folders");
    let reader = wf.add_node(
        NodeSpec::new("test.dataset")
            .with_name("reader")
            .with_property("dataset", dataset.path().to_string_lossy().into_owned())
            .with_property("workdir", scratch_path.clone()),
    );
    let out = tempfile::tempdir().unwrap();

    let spec = export(&wf, &HashSet::from([reader]), runtime.registry(), out.path()).unwrap();

    let dir_name = dataset.path().file_name().unwrap().to_string_lossy().into_owned();
    let copied = out.path().join("inputs").join(format!("reader_{}", dir_name));
    assert_eq!(std::fs::read_to_string(copied.join("rows.csv")).unwrap(), "a\n1\n");
    assert_eq!(spec.files.len(), 1, "files: {:?}", spec.files);

    let bundle = Bundle::load(out.path()).unwrap();
    let node = bundle.workflow.find_node(reader).unwrap();
    assert_eq!(node.properties["workdir"], Value::from(scratch_path));
}

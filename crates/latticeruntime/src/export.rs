//! Subgraph export into a self-contained bundle, and re-import of bundles.
//!
//! Bundle layout:
//!
//! ```text
//! workflow.json      induced subgraph, original node ids
//! interface.json     inferred inputs/outputs (ExportSpec)
//! requirements.txt   consolidated dependency manifest
//! components/        manifest + script files of process components
//! inputs/            copied file-valued properties
//! README.md
//! ```

use crate::dependency::{DependencyError, Manifest};
use crate::registry::ComponentRegistry;
use latticecore::{DataKind, NodeId, NodeSpec, Value, Workflow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const WORKFLOW_FILE: &str = "workflow.json";
pub const INTERFACE_FILE: &str = "interface.json";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const COMPONENTS_DIR: &str = "components";
pub const INPUTS_DIR: &str = "inputs";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Nothing selected for export")]
    EmptySelection,

    #[error("Selected node {0} is not a top-level node of the workflow")]
    UnknownNode(NodeId),

    #[error("Unknown interface input: {0}")]
    UnknownInput(String),

    #[error("Invalid requirements: {0}")]
    Dependency(#[from] DependencyError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One named port of a bundle's boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfacePort {
    pub name: String,
    pub node: NodeId,
    pub port: String,
    pub kind: DataKind,
}

/// Inferred interface of an exported subgraph
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExportSpec {
    pub inputs: Vec<InterfacePort>,
    pub outputs: Vec<InterfacePort>,
    /// Bundle-relative paths of copied files
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl ExportSpec {
    pub fn input(&self, name: &str) -> Option<&InterfacePort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&InterfacePort> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// Hands out `<label>_<port>` names, suffixing `_2`, `_3`, ... on collision
#[derive(Default)]
struct Names {
    taken: HashSet<String>,
}

impl Names {
    fn claim(&mut self, label: &str, port: &str) -> String {
        let base = format!("{}_{}", label, port);
        let mut name = base.clone();
        let mut n = 2;
        while !self.taken.insert(name.clone()) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        name
    }
}

/// Compute the boundary of `selected`.
///
/// An input port is part of the interface when an edge from outside the
/// selection feeds it, or when it is marked exposed. An output port is part
/// of the interface when nothing inside the selection consumes it, or when it
/// is marked exposed.
pub fn infer_interface(workflow: &Workflow, selected: &HashSet<NodeId>) -> Result<ExportSpec, ExportError> {
    if selected.is_empty() {
        return Err(ExportError::EmptySelection);
    }
    if let Some(missing) = selected.iter().find(|id| workflow.find_node(**id).is_none()) {
        return Err(ExportError::UnknownNode(*missing));
    }

    let mut spec = ExportSpec::default();
    let mut input_names = Names::default();
    let mut output_names = Names::default();
    for node in workflow.nodes.iter().filter(|n| selected.contains(&n.id)) {
        let label = node.label();
        for port in &node.inputs {
            let fed_from_outside = workflow.connections.iter().any(|c| {
                c.to_node == node.id && c.to_port == port.name && !selected.contains(&c.from_node)
            });
            if fed_from_outside || port.exposed {
                spec.inputs.push(InterfacePort {
                    name: input_names.claim(&label, &port.name),
                    node: node.id,
                    port: port.name.clone(),
                    kind: port.kind.clone(),
                });
            }
        }
        for port in &node.outputs {
            let consumed_inside = workflow.connections.iter().any(|c| {
                c.from_node == node.id && c.from_port == port.name && selected.contains(&c.to_node)
            });
            if !consumed_inside || port.exposed {
                spec.outputs.push(InterfacePort {
                    name: output_names.claim(&label, &port.name),
                    node: node.id,
                    port: port.name.clone(),
                    kind: port.kind.clone(),
                });
            }
        }
    }
    Ok(spec)
}

/// Induced subgraph of `selected`: original ids, internal edges only
pub fn induced_subgraph(workflow: &Workflow, selected: &HashSet<NodeId>) -> Workflow {
    Workflow {
        id: workflow.id,
        name: workflow.name.clone(),
        description: workflow.description.clone(),
        nodes: workflow
            .nodes
            .iter()
            .filter(|n| selected.contains(&n.id))
            .cloned()
            .collect(),
        connections: workflow
            .connections
            .iter()
            .filter(|c| selected.contains(&c.from_node) && selected.contains(&c.to_node))
            .cloned()
            .collect(),
        settings: workflow.settings.clone(),
    }
}

/// Write a bundle for `selected` into `target_dir` and return its interface
pub fn export(
    workflow: &Workflow,
    selected: &HashSet<NodeId>,
    registry: &ComponentRegistry,
    target_dir: &Path,
) -> Result<ExportSpec, ExportError> {
    let mut spec = infer_interface(workflow, selected)?;
    let mut subgraph = induced_subgraph(workflow, selected);

    std::fs::create_dir_all(target_dir).map_err(io_err(target_dir))?;

    let types: BTreeSet<String> = subgraph
        .all_nodes()
        .iter()
        .map(|n| n.node_type.clone())
        .collect();

    // file-valued properties
    let inputs_dir = target_dir.join(INPUTS_DIR);
    let mut copy_error = None;
    for_each_node_mut(&mut subgraph.nodes, &mut |node: &mut NodeSpec| {
        if copy_error.is_some() {
            return;
        }
        let file_kinds: HashMap<String, DataKind> = registry
            .metadata(&node.node_type)
            .map(|m| {
                m.properties
                    .into_iter()
                    .filter(|p| p.kind.is_file_like())
                    .map(|p| (p.name, p.kind))
                    .collect()
            })
            .unwrap_or_default();
        let label = node.label();
        for (key, value) in node.properties.iter_mut() {
            let Value::String(raw) = value else {
                continue;
            };
            let source = PathBuf::from(raw.as_str());
            let declared = file_kinds.get(key);
            if !source.exists() || !(source.is_absolute() || declared.is_some()) {
                continue;
            }
            // only a property declared as a folder may pull in a directory
            if source.is_dir() && declared != Some(&DataKind::Folder) {
                continue;
            }
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let relative = PathBuf::from(INPUTS_DIR)
                .join(format!("{}_{}", label, file_name.to_string_lossy()));
            if let Err(e) = std::fs::create_dir_all(&inputs_dir)
                .map_err(io_err(&inputs_dir))
                .and_then(|_| copy_path(&source, &target_dir.join(&relative)))
            {
                copy_error = Some(e);
                return;
            }
            tracing::debug!(from = %source.display(), to = %relative.display(), "Copied input file");
            *raw = relative.to_string_lossy().into_owned();
            spec.files.push(relative);
        }
    });
    if let Some(e) = copy_error {
        return Err(e);
    }

    // component code
    let mut builtin = Vec::new();
    let components_dir = target_dir.join(COMPONENTS_DIR);
    for node_type in &types {
        match registry.source(node_type) {
            Some(source) => {
                for file in &source.files {
                    let to = components_dir.join(file);
                    if let Some(parent) = to.parent() {
                        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
                    }
                    copy_path(&source.root.join(file), &to)?;
                    spec.files.push(PathBuf::from(COMPONENTS_DIR).join(file));
                }
            }
            None => builtin.push(node_type.clone()),
        }
    }

    // dependency manifest
    let mut requirement_specs: Vec<String> = types
        .iter()
        .filter_map(|t| registry.metadata(t))
        .map(|m| m.requirements)
        .collect();
    for node in subgraph.all_nodes() {
        if let Some(custom) = node.properties.get("requirements").and_then(Value::as_str) {
            requirement_specs.push(custom.to_string());
        }
    }
    let manifest = Manifest::merge(requirement_specs.iter().map(String::as_str))?;

    write(target_dir, WORKFLOW_FILE, &serde_json::to_string_pretty(&subgraph)?)?;
    write(target_dir, INTERFACE_FILE, &serde_json::to_string_pretty(&spec)?)?;
    write(target_dir, REQUIREMENTS_FILE, &manifest.render())?;
    write(target_dir, "README.md", &readme(&subgraph, &spec, &manifest, &builtin))?;

    tracing::info!(
        dir = %target_dir.display(),
        nodes = subgraph.nodes.len(),
        inputs = spec.inputs.len(),
        outputs = spec.outputs.len(),
        "Exported bundle"
    );
    Ok(spec)
}

fn write(dir: &Path, name: &str, contents: &str) -> Result<(), ExportError> {
    let path = dir.join(name);
    std::fs::write(&path, contents).map_err(io_err(&path))
}

fn copy_path(from: &Path, to: &Path) -> Result<(), ExportError> {
    if from.is_dir() {
        std::fs::create_dir_all(to).map_err(io_err(to))?;
        for entry in std::fs::read_dir(from).map_err(io_err(from))? {
            let entry = entry.map_err(io_err(from))?;
            copy_path(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(from, to).map(|_| ()).map_err(io_err(from))
    }
}

fn for_each_node_mut(nodes: &mut [NodeSpec], f: &mut dyn FnMut(&mut NodeSpec)) {
    for node in nodes {
        f(node);
        if let Some(body) = node.control.as_mut().and_then(|c| c.body_mut()) {
            for_each_node_mut(&mut body.nodes, f);
        }
    }
}

fn readme(workflow: &Workflow, spec: &ExportSpec, manifest: &Manifest, builtin: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", workflow.name);
    let _ = writeln!(out, "Exported {} nodes.\n", workflow.nodes.len());
    let _ = writeln!(out, "## Inputs\n");
    for port in &spec.inputs {
        let _ = writeln!(out, "- `{}` ({})", port.name, port.kind);
    }
    let _ = writeln!(out, "\n## Outputs\n");
    for port in &spec.outputs {
        let _ = writeln!(out, "- `{}` ({})", port.name, port.kind);
    }
    if !manifest.is_empty() {
        let _ = writeln!(out, "\n## Requirements\n\n```\n{}```", manifest.render());
    }
    if !builtin.is_empty() {
        let _ = writeln!(out, "\n## Built-in components\n");
        for name in builtin {
            let _ = writeln!(out, "- `{}`", name);
        }
    }
    let _ = writeln!(out, "\nRun with `lattice run-bundle <dir> --inputs inputs.json`.");
    out
}

/// A bundle read back from disk
#[derive(Debug, Clone)]
pub struct Bundle {
    pub root: PathBuf,
    pub workflow: Workflow,
    pub interface: ExportSpec,
}

impl Bundle {
    /// Read a bundle. Relative `inputs/` references are resolved against `dir`.
    pub fn load(dir: &Path) -> Result<Self, ExportError> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path).map_err(io_err(&path))
        };
        let mut workflow: Workflow = serde_json::from_str(&read(WORKFLOW_FILE)?)?;
        let interface: ExportSpec = serde_json::from_str(&read(INTERFACE_FILE)?)?;

        let prefix = format!("{}/", INPUTS_DIR);
        for_each_node_mut(&mut workflow.nodes, &mut |node: &mut NodeSpec| {
            for value in node.properties.values_mut() {
                if let Value::String(raw) = value {
                    if raw.starts_with(&prefix) {
                        *raw = dir.join(raw.as_str()).to_string_lossy().into_owned();
                    }
                }
            }
        });

        Ok(Self {
            root: dir.to_path_buf(),
            workflow,
            interface,
        })
    }

    pub fn components_dir(&self) -> PathBuf {
        self.root.join(COMPONENTS_DIR)
    }

    /// Contents of `requirements.txt`; empty when the bundle has none
    pub fn requirements(&self) -> String {
        std::fs::read_to_string(self.root.join(REQUIREMENTS_FILE)).unwrap_or_default()
    }

    /// Map interface input values to node port bindings
    pub fn bind(
        &self,
        values: &BTreeMap<String, Value>,
    ) -> Result<HashMap<NodeId, BTreeMap<String, Value>>, ExportError> {
        bind_interface(&self.interface, values)
    }
}

pub fn bind_interface(
    spec: &ExportSpec,
    values: &BTreeMap<String, Value>,
) -> Result<HashMap<NodeId, BTreeMap<String, Value>>, ExportError> {
    let mut bindings: HashMap<NodeId, BTreeMap<String, Value>> = HashMap::new();
    for (name, value) in values {
        let port = spec
            .input(name)
            .ok_or_else(|| ExportError::UnknownInput(name.clone()))?;
        bindings
            .entry(port.node)
            .or_default()
            .insert(port.port.clone(), value.clone());
    }
    Ok(bindings)
}

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = Uuid;

pub const BRANCH_NODE_TYPE: &str = "control.branch";
pub const ITERATE_NODE_TYPE: &str = "control.iterate";
pub const LOOP_NODE_TYPE: &str = "control.loop";
pub const ELSE_PORT: &str = "else";

/// Complete workflow definition. This is the persisted graph document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node,
            from_port: from_port.into(),
            to_node,
            to_port: to_port.into(),
        });
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_mut(&mut self, id: NodeId) -> Option<&mut NodeSpec> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn graph(&self) -> Graph<'_> {
        Graph {
            nodes: &self.nodes,
            connections: &self.connections,
        }
    }

    /// Every node in the document, including the bodies of iteration and loop nodes
    pub fn all_nodes(&self) -> Vec<&NodeSpec> {
        let mut out = Vec::new();
        collect_nodes(&self.nodes, &mut out);
        out
    }
}

fn collect_nodes<'a>(nodes: &'a [NodeSpec], out: &mut Vec<&'a NodeSpec>) {
    for node in nodes {
        out.push(node);
        if let Some(body) = node.control.as_ref().and_then(ControlFlow::body) {
            collect_nodes(&body.nodes, out);
        }
    }
}

/// Borrowed view over one level of a graph: the top-level workflow or a nested body
#[derive(Debug, Clone, Copy)]
pub struct Graph<'a> {
    pub nodes: &'a [NodeSpec],
    pub connections: &'a [Connection],
}

impl<'a> Graph<'a> {
    pub fn find_node(&self, id: NodeId) -> Option<&'a NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.to_node == id)
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.from_node == id)
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "config")]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlFlow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodeSpec {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_type: node_type.into(),
            name: None,
            properties: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            timeout_ms: None,
            control: None,
            position: None,
        }
    }

    /// Conditional branch with one output port per condition, plus `else`
    pub fn branch<N, E>(conditions: impl IntoIterator<Item = (N, E)>) -> Self
    where
        N: Into<String>,
        E: Into<String>,
    {
        let conditions: Vec<BranchCondition> = conditions
            .into_iter()
            .map(|(name, expr)| BranchCondition {
                name: name.into(),
                expr: expr.into(),
            })
            .collect();
        let mut node = Self::new(BRANCH_NODE_TYPE).with_input("input", DataKind::Any);
        for cond in &conditions {
            node = node.with_output(cond.name.clone(), DataKind::Any);
        }
        node = node.with_output(ELSE_PORT, DataKind::Any);
        node.control = Some(ControlFlow::Branch(BranchSpec {
            conditions,
            else_branch: true,
            exclusive: false,
        }));
        node
    }

    /// Iteration over the `items` input (or an items expression), collecting `results`
    pub fn iterate(body: SubGraph) -> Self {
        let mut node = Self::new(ITERATE_NODE_TYPE)
            .with_input("items", DataKind::List)
            .with_output("results", DataKind::List);
        node.control = Some(ControlFlow::Iterate(IterateSpec {
            items: None,
            body,
            policy: None,
        }));
        node
    }

    /// Bounded loop feeding each pass output into the next pass
    pub fn bounded_loop(mode: LoopMode, max_iterations: u32, body: SubGraph) -> Self {
        let mut node = Self::new(LOOP_NODE_TYPE)
            .with_input("input", DataKind::Any)
            .with_output("output", DataKind::Any)
            .with_output("iterations", DataKind::Number);
        node.control = Some(ControlFlow::Loop(LoopSpec {
            mode,
            max_iterations: Some(max_iterations),
            body,
        }));
        node
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, kind: DataKind) -> Self {
        self.inputs.push(PortSpec::new(name, kind));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, kind: DataKind) -> Self {
        self.outputs.push(PortSpec::new(name, kind));
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Mark an already declared port as part of an exported interface
    pub fn expose(mut self, port: &str) -> Self {
        for p in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if p.name == port {
                p.exposed = true;
            }
        }
        self
    }

    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn is_control_flow(&self) -> bool {
        self.control.is_some()
    }

    /// Identifier-safe label: the node name if set, otherwise the id
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => sanitize_identifier(name),
            _ => format!("node_{}", self.id.simple()),
        }
    }
}

/// Replace every character that cannot appear in an expression identifier
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Declared data kind of a port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataKind {
    Any,
    Text,
    Number,
    Boolean,
    Record,
    List,
    File,
    Folder,
    Csv,
    Model,
    Image,
    /// A kind string that is not part of the vocabulary; rejected by validation
    Unknown(String),
}

impl DataKind {
    pub fn as_str(&self) -> &str {
        match self {
            DataKind::Any => "any",
            DataKind::Text => "text",
            DataKind::Number => "number",
            DataKind::Boolean => "boolean",
            DataKind::Record => "record",
            DataKind::List => "list",
            DataKind::File => "file",
            DataKind::Folder => "folder",
            DataKind::Csv => "csv",
            DataKind::Model => "model",
            DataKind::Image => "image",
            DataKind::Unknown(name) => name,
        }
    }

    /// Whether an output of kind `self` may feed an input of kind `target`
    pub fn flows_into(&self, target: &DataKind) -> bool {
        match (self, target) {
            (DataKind::Unknown(_), _) | (_, DataKind::Unknown(_)) => false,
            (DataKind::Any, _) | (_, DataKind::Any) => true,
            (DataKind::Csv | DataKind::Model | DataKind::Image, DataKind::File) => true,
            (a, b) => a == b,
        }
    }

    pub fn is_file_like(&self) -> bool {
        matches!(
            self,
            DataKind::File | DataKind::Folder | DataKind::Csv | DataKind::Model | DataKind::Image
        )
    }
}

impl From<String> for DataKind {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "any" => DataKind::Any,
            "text" | "text_area" | "string" => DataKind::Text,
            "number" | "int" | "float" => DataKind::Number,
            "boolean" | "bool" => DataKind::Boolean,
            "record" | "json" => DataKind::Record,
            "list" | "array" => DataKind::List,
            "file" => DataKind::File,
            "folder" => DataKind::Folder,
            "csv" => DataKind::Csv,
            "model" => DataKind::Model,
            "image" => DataKind::Image,
            _ => DataKind::Unknown(raw),
        }
    }
}

impl From<DataKind> for String {
    fn from(kind: DataKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named, typed attachment point on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub kind: DataKind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exposed: bool,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, kind: DataKind) -> Self {
        Self {
            name: name.into(),
            kind,
            exposed: false,
        }
    }
}

/// Connection between an output port and an input port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from_node, self.from_port, self.to_node, self.to_port
        )
    }
}

/// A port on a specific node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddress {
    pub node: NodeId,
    pub port: String,
}

impl PortAddress {
    pub fn new(node: NodeId, port: impl Into<String>) -> Self {
        Self {
            node,
            port: port.into(),
        }
    }
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Structural behaviour of a control-flow node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFlow {
    Branch(BranchSpec),
    Iterate(IterateSpec),
    Loop(LoopSpec),
}

impl ControlFlow {
    pub fn body(&self) -> Option<&SubGraph> {
        match self {
            ControlFlow::Branch(_) => None,
            ControlFlow::Iterate(spec) => Some(&spec.body),
            ControlFlow::Loop(spec) => Some(&spec.body),
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut SubGraph> {
        match self {
            ControlFlow::Branch(_) => None,
            ControlFlow::Iterate(spec) => Some(&mut spec.body),
            ControlFlow::Loop(spec) => Some(&mut spec.body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub conditions: Vec<BranchCondition>,
    #[serde(default = "default_true")]
    pub else_branch: bool,
    /// First matching condition wins instead of every matching one
    #[serde(default)]
    pub exclusive: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
    pub name: String,
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateSpec {
    /// Expression yielding the sequence; falls back to the `items` input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
    pub body: SubGraph,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<IterationPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationPolicy {
    /// Any failed element fails the iteration node
    AllOrNothing,
    /// Failed elements are reported per element; the node still succeeds
    #[default]
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    pub mode: LoopMode,
    /// Hard ceiling on passes; the workflow default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    pub body: SubGraph,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopMode {
    Count { times: u32 },
    While { condition: String },
}

/// Nested graph owned by an iteration or loop node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubGraph {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Input ports that receive the current element or loop data
    #[serde(default)]
    pub entry: Vec<PortAddress>,
    /// Output port collected as the result of one pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<PortAddress>,
}

impl SubGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node,
            from_port: from_port.into(),
            to_node,
            to_port: to_port.into(),
        });
    }

    pub fn with_entry(mut self, node: NodeId, port: impl Into<String>) -> Self {
        self.entry.push(PortAddress::new(node, port));
        self
    }

    pub fn with_exit(mut self, node: NodeId, port: impl Into<String>) -> Self {
        self.exit = Some(PortAddress::new(node, port));
        self
    }

    pub fn graph(&self) -> Graph<'_> {
        Graph {
            nodes: &self.nodes,
            connections: &self.connections,
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Default per-node execution budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default = "default_parallel")]
    pub max_parallel_nodes: usize,
    #[serde(default)]
    pub on_error: ErrorHandling,
    #[serde(default)]
    pub iteration_policy: IterationPolicy,
    #[serde(default = "default_loop_ceiling")]
    pub loop_ceiling: u32,
}

fn default_parallel() -> usize {
    10
}

fn default_loop_ceiling() -> u32 {
    100
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_execution_time_ms: None,
            max_parallel_nodes: default_parallel(),
            on_error: ErrorHandling::default(),
            iteration_policy: IterationPolicy::default(),
            loop_ceiling: default_loop_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorHandling {
    /// Stop dispatching after the first failure; pending nodes become skipped
    StopWorkflow,
    /// Failures only affect the failed node and its dependents
    #[default]
    ContinueOnError,
}

use crate::workflow::{DataKind, PortSpec};
use crate::{events::EventEmitter, NodeError, NodeId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Core trait that every executable component implements.
///
/// Components are registered once and shared by every node that references
/// their type, so `run` must not keep per-node state on `self`.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique type identifier (e.g., "debug.log", "transform.json_parse")
    fn component_type(&self) -> &str;

    /// Declared ports, properties and third-party requirements
    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata::default()
    }

    /// Execute the component with given context.
    ///
    /// Native components share the runtime's worker threads and can only be
    /// stopped at an `.await`. Long CPU-bound or blocking work belongs in
    /// `tokio::task::spawn_blocking` or a process component, otherwise a
    /// timeout or cancellation reports the node as stopped while the work
    /// keeps a worker busy until it returns.
    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError>;

    /// Check literal property values before the run starts. Values holding
    /// `$...$` expressions are only known at run time and should be skipped.
    fn validate_config(&self, _properties: &BTreeMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each component invocation
#[derive(Clone)]
pub struct ComponentContext {
    /// Unique node instance ID
    pub node_id: NodeId,

    /// Input values from connected nodes and caller bindings
    pub inputs: BTreeMap<String, Value>,

    /// Node properties after expression resolution
    pub properties: BTreeMap<String, Value>,

    /// Environment overlay installed for this invocation only
    pub env: BTreeMap<String, String>,

    /// Comma-separated requirement list declared for this node
    pub requirements: String,

    /// Log/event emitter; lines land in this node's log
    pub events: EventEmitter,

    /// Cooperative cancellation signal
    pub cancellation: CancellationToken,
}

impl ComponentContext {
    pub fn new(node_id: NodeId, events: EventEmitter) -> Self {
        Self {
            node_id,
            inputs: BTreeMap::new(),
            properties: BTreeMap::new(),
            env: BTreeMap::new(),
            requirements: String::new(),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get property value or return error
    pub fn require_property(&self, name: &str) -> Result<&Value, NodeError> {
        self.properties
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing property: {}", name)))
    }

    /// Get property with default
    pub fn get_property_or(&self, name: &str, default: Value) -> Value {
        self.properties.get(name).cloned().unwrap_or(default)
    }
}

/// Output from a component invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: BTreeMap<String, Value>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }
}

/// Static description of a component type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    /// Comma-separated capability list, e.g. "numpy>=1.20, pandas"
    #[serde(default)]
    pub requirements: String,
}

fn default_category() -> String {
    "general".to_string()
}

impl Default for ComponentMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: default_category(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: Vec::new(),
            requirements: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(default = "default_property_kind")]
    pub kind: DataKind,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub label: String,
}

fn default_property_kind() -> DataKind {
    DataKind::Text
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, kind: DataKind) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            kind,
            default: Value::Null,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }
}

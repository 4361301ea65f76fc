use crate::validation::ValidationError;
use crate::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Workflow failed validation: {}", summarize(.0))]
    Validation(Vec<ValidationError>),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Node-scoped failures. None of these abort a run on their own; the
/// scheduler records them against the node and its dependents.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("{0}")]
    Evaluation(#[from] EvaluationError),

    /// Failure signature that the dependency resolver may be able to repair
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    #[error("Unrepaired dependency '{requirement}': {detail}")]
    Dependency { requirement: String, detail: String },

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Upstream node {upstream} failed")]
    UpstreamFailed { upstream: NodeId },

    #[error("{failed} of {total} iteration passes failed")]
    IterationFailed { failed: usize, total: usize },

    #[error("Loop exceeded its ceiling of {ceiling} passes")]
    LoopCeilingExceeded { ceiling: u32 },
}

impl NodeError {
    /// Taxonomy bucket reported alongside the message
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Evaluation(_) => "evaluation",
            NodeError::MissingCapability(_) | NodeError::Dependency { .. } => "dependency",
            NodeError::Timeout { .. } => "timeout",
            NodeError::Cancelled => "cancellation",
            NodeError::UpstreamFailed { .. } => "upstream",
            _ => "execution",
        }
    }

    pub fn is_missing_capability(&self) -> bool {
        matches!(self, NodeError::MissingCapability(_))
    }
}

/// Expression or variable resolution failure for one property of one node
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Evaluation error in node {node} at '{path}' ({text}): {reason}")]
pub struct EvaluationError {
    pub node: String,
    pub path: String,
    pub text: String,
    pub reason: String,
}

impl EvaluationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            node: String::new(),
            path: String::new(),
            text: String::new(),
            reason: reason.into(),
        }
    }

    pub fn at(mut self, node: impl Into<String>, path: impl Into<String>) -> Self {
        self.node = node.into();
        self.path = path.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),
}

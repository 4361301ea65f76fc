use crate::{NodeError, NodeId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of one node within a run.
///
/// `Pending -> Ready -> Running -> {Success, Failed, Skipped}`; `Idle` is a
/// node that is not part of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One time-stamped line of a node's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Serializable form of a node-scoped error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub kind: String,
    pub message: String,
}

impl From<&NodeError> for NodeFailure {
    fn from(err: &NodeError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one pass of an iteration or loop node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassOutcome {
    pub index: usize,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeFailure>,
}

/// Result of running one node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeRunResult {
    pub success: bool,
    pub outputs: BTreeMap<String, Value>,
    pub logs: Vec<LogLine>,
    pub elapsed_ms: u64,
    /// Invocations performed; 2 means a dependency repair was followed by a retry
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passes: Vec<PassOutcome>,
}

impl NodeRunResult {
    pub fn succeeded(outputs: BTreeMap<String, Value>, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            outputs,
            elapsed_ms,
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn failed(error: &NodeError, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            elapsed_ms,
            attempts: 1,
            error: Some(NodeFailure::from(error)),
            ..Self::default()
        }
    }
}

/// Per-run view of a node used by the results document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<NodeRunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeFailure>,
    pub logs: Vec<LogLine>,
}

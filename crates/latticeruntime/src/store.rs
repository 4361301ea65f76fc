//! Per-node status and log ledger of one run.
//!
//! The scheduler is the only writer. Observers may read at any time; every
//! node owns its own slot so writes to different nodes never contend.

use chrono::{DateTime, Utc};
use latticecore::{
    Connection, ExecutionEvent, ExecutionId, LogLevel, LogLine, LogSink, NodeId, NodeReport,
    NodeRunResult, NodeSpec, NodeStatus,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Display state of a connection, derived from its endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Idle,
    UpstreamRunning,
    DownstreamRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: NodeStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct NodeSlot {
    name: Option<String>,
    status: NodeStatus,
    history: Vec<StatusChange>,
    logs: Vec<LogLine>,
    result: Option<NodeRunResult>,
}

impl NodeSlot {
    fn new(name: Option<String>, status: NodeStatus) -> Self {
        Self {
            name,
            status,
            history: vec![StatusChange {
                status,
                at: Utc::now(),
            }],
            logs: Vec::new(),
            result: None,
        }
    }
}

pub struct StateStore {
    execution_id: ExecutionId,
    slots: RwLock<HashMap<NodeId, Arc<RwLock<NodeSlot>>>>,
    order: RwLock<Vec<NodeId>>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl StateStore {
    pub fn new(execution_id: ExecutionId, events: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            execution_id,
            slots: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Create the slot for `node` with its initial status
    pub fn register(&self, node: &NodeSpec, status: NodeStatus) {
        let mut slots = self.slots.write();
        if slots.contains_key(&node.id) {
            return;
        }
        slots.insert(
            node.id,
            Arc::new(RwLock::new(NodeSlot::new(node.name.clone(), status))),
        );
        self.order.write().push(node.id);
    }

    fn slot(&self, id: NodeId) -> Arc<RwLock<NodeSlot>> {
        if let Some(slot) = self.slots.read().get(&id) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(id)
            .or_insert_with(|| {
                self.order.write().push(id);
                Arc::new(RwLock::new(NodeSlot::new(None, NodeStatus::Idle)))
            })
            .clone()
    }

    /// Last write wins; every transition is kept in the history
    pub fn set_status(&self, id: NodeId, status: NodeStatus) {
        let slot = self.slot(id);
        let at = Utc::now();
        {
            let mut slot = slot.write();
            slot.status = status;
            slot.history.push(StatusChange { status, at });
        }
        tracing::debug!(node_id = %id, %status, "Node status changed");
        let _ = self.events.send(ExecutionEvent::NodeStatusChanged {
            execution_id: self.execution_id,
            node_id: id,
            status,
            timestamp: at,
        });
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.slots.read().get(&id).map(|slot| slot.read().status)
    }

    pub fn history(&self, id: NodeId) -> Vec<StatusChange> {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.read().history.clone())
            .unwrap_or_default()
    }

    pub fn append_log(&self, id: NodeId, level: LogLevel, message: impl Into<String>) {
        let line = LogLine::new(level, message);
        self.slot(id).write().logs.push(line);
    }

    pub fn logs(&self, id: NodeId) -> Vec<LogLine> {
        self.logs_since(id, 0)
    }

    /// Log lines appended after the first `from` lines
    pub fn logs_since(&self, id: NodeId, from: usize) -> Vec<LogLine> {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.read().logs.iter().skip(from).cloned().collect())
            .unwrap_or_default()
    }

    pub fn log_len(&self, id: NodeId) -> usize {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.read().logs.len())
            .unwrap_or(0)
    }

    pub fn record_result(&self, id: NodeId, result: NodeRunResult) {
        self.slot(id).write().result = Some(result);
    }

    pub fn result(&self, id: NodeId) -> Option<NodeRunResult> {
        self.slots
            .read()
            .get(&id)
            .and_then(|slot| slot.read().result.clone())
    }

    /// Projection for display: never consulted by the scheduler
    pub fn edge_state(&self, connection: &Connection) -> EdgeState {
        if self.status(connection.from_node) == Some(NodeStatus::Running) {
            EdgeState::UpstreamRunning
        } else if self.status(connection.to_node) == Some(NodeStatus::Running) {
            EdgeState::DownstreamRunning
        } else {
            EdgeState::Idle
        }
    }

    /// Every node, in registration order
    pub fn snapshot(&self) -> Vec<NodeReport> {
        let order = self.order.read().clone();
        let slots = self.slots.read();
        order
            .into_iter()
            .filter_map(|id| {
                let slot = slots.get(&id)?.read();
                Some(NodeReport {
                    node_id: id,
                    name: slot.name.clone(),
                    status: slot.status,
                    error: slot.result.as_ref().and_then(|r| r.error.clone()),
                    result: slot.result.clone(),
                    logs: slot.logs.clone(),
                })
            })
            .collect()
    }
}

impl LogSink for StateStore {
    fn append(&self, node_id: NodeId, level: LogLevel, message: String) {
        self.append_log(node_id, level, message);
    }
}

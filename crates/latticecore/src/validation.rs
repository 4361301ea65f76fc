//! Static graph validation and deterministic scheduling order.
//!
//! Validation runs before any execution; a non-empty error list refuses the
//! run. Control-flow bodies are validated recursively as independent levels.

use crate::workflow::{ControlFlow, DataKind, Graph, NodeSpec, SubGraph};
use crate::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// Malformed graph; any of these prevents the run from starting
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Node id {node_id} is declared more than once")]
    DuplicateNode { node_id: NodeId },

    #[error("Node {node_id} declares {direction} port '{port}' more than once")]
    DuplicatePort {
        node_id: NodeId,
        port: String,
        direction: PortDirection,
    },

    #[error("Port '{port}' on node {node_id} has undeclared data kind '{kind}'")]
    UndeclaredDataKind {
        node_id: NodeId,
        port: String,
        kind: String,
    },

    #[error("Connection {connection} references unknown node {node_id}")]
    UnknownNode { connection: String, node_id: NodeId },

    #[error("Connection {connection} references unknown port '{port}' on node {node_id}")]
    UnknownPort {
        connection: String,
        node_id: NodeId,
        port: String,
    },

    #[error("Connection {connection} must run from an output to an input port")]
    DirectionMismatch { connection: String },

    #[error("Connection {connection} joins incompatible kinds {source_kind} -> {target_kind}")]
    IncompatibleKinds {
        connection: String,
        source_kind: DataKind,
        target_kind: DataKind,
    },

    #[error("Input '{port}' on node {node_id} receives more than one connection")]
    FanIn { node_id: NodeId, port: String },

    #[error("Cycle detected among nodes {}", join_ids(.nodes))]
    Cycle { nodes: Vec<NodeId> },

    #[error("Unknown node type '{node_type}' for node {node_id}")]
    UnknownNodeType { node_id: NodeId, node_type: String },

    #[error("Invalid control flow on node {node_id}: {reason}")]
    InvalidControlFlow { node_id: NodeId, reason: String },

    #[error("Invalid configuration on node {node_id}: {reason}")]
    InvalidConfig { node_id: NodeId, reason: String },
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Structural validation without component-type checks
pub fn validate(graph: Graph<'_>) -> Vec<ValidationError> {
    validate_with(graph, &|_| true)
}

/// Structural validation plus a check that every non-control node type is known
pub fn validate_with(graph: Graph<'_>, is_known_type: &dyn Fn(&str) -> bool) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_level(graph, is_known_type, &mut errors);
    errors
}

fn validate_level(
    graph: Graph<'_>,
    is_known_type: &dyn Fn(&str) -> bool,
    errors: &mut Vec<ValidationError>,
) {
    let mut seen = HashSet::new();
    for node in graph.nodes {
        if !seen.insert(node.id) {
            errors.push(ValidationError::DuplicateNode { node_id: node.id });
        }
        check_ports(node, errors);
        match &node.control {
            Some(control) => check_control(node, control, is_known_type, errors),
            None => {
                if !is_known_type(&node.node_type) {
                    errors.push(ValidationError::UnknownNodeType {
                        node_id: node.id,
                        node_type: node.node_type.clone(),
                    });
                }
            }
        }
    }

    let nodes: HashMap<NodeId, &NodeSpec> = graph.nodes.iter().map(|n| (n.id, n)).collect();
    let mut fed_inputs = HashSet::new();

    for conn in graph.connections {
        let label = conn.to_string();
        let (Some(source), Some(target)) = (nodes.get(&conn.from_node), nodes.get(&conn.to_node))
        else {
            for id in [conn.from_node, conn.to_node] {
                if !nodes.contains_key(&id) {
                    errors.push(ValidationError::UnknownNode {
                        connection: label.clone(),
                        node_id: id,
                    });
                }
            }
            continue;
        };

        let source_port = source.output(&conn.from_port);
        let target_port = target.input(&conn.to_port);
        let reversed = source_port.is_none() && source.input(&conn.from_port).is_some()
            || target_port.is_none() && target.output(&conn.to_port).is_some();
        if reversed {
            errors.push(ValidationError::DirectionMismatch { connection: label });
            continue;
        }
        let Some(source_port) = source_port else {
            errors.push(ValidationError::UnknownPort {
                connection: label,
                node_id: source.id,
                port: conn.from_port.clone(),
            });
            continue;
        };
        let Some(target_port) = target_port else {
            errors.push(ValidationError::UnknownPort {
                connection: label,
                node_id: target.id,
                port: conn.to_port.clone(),
            });
            continue;
        };

        if !fed_inputs.insert((conn.to_node, conn.to_port.as_str())) {
            errors.push(ValidationError::FanIn {
                node_id: conn.to_node,
                port: conn.to_port.clone(),
            });
        }

        let both_declared = !matches!(source_port.kind, DataKind::Unknown(_))
            && !matches!(target_port.kind, DataKind::Unknown(_));
        if both_declared && !source_port.kind.flows_into(&target_port.kind) {
            errors.push(ValidationError::IncompatibleKinds {
                connection: label,
                source_kind: source_port.kind.clone(),
                target_kind: target_port.kind.clone(),
            });
        }
    }

    if let Err(cycle) = topological_order(graph) {
        errors.push(cycle);
    }
}

fn check_ports(node: &NodeSpec, errors: &mut Vec<ValidationError>) {
    for (ports, direction) in [
        (&node.inputs, PortDirection::Input),
        (&node.outputs, PortDirection::Output),
    ] {
        let mut names = HashSet::new();
        for port in ports {
            if !names.insert(port.name.as_str()) {
                errors.push(ValidationError::DuplicatePort {
                    node_id: node.id,
                    port: port.name.clone(),
                    direction,
                });
            }
            if let DataKind::Unknown(kind) = &port.kind {
                errors.push(ValidationError::UndeclaredDataKind {
                    node_id: node.id,
                    port: port.name.clone(),
                    kind: kind.clone(),
                });
            }
        }
    }
}

fn check_control(
    node: &NodeSpec,
    control: &ControlFlow,
    is_known_type: &dyn Fn(&str) -> bool,
    errors: &mut Vec<ValidationError>,
) {
    let mut invalid = |reason: String| {
        errors.push(ValidationError::InvalidControlFlow {
            node_id: node.id,
            reason,
        })
    };
    match control {
        ControlFlow::Branch(spec) => {
            let mut names = HashSet::new();
            for cond in &spec.conditions {
                if !names.insert(cond.name.as_str()) {
                    invalid(format!("branch '{}' is declared twice", cond.name));
                }
                if node.output(&cond.name).is_none() {
                    invalid(format!("branch '{}' has no output port", cond.name));
                }
            }
        }
        ControlFlow::Iterate(spec) => {
            if spec.items.is_none() && node.input("items").is_none() {
                invalid("iteration needs an items expression or an 'items' input".to_string());
            }
            check_body(&spec.body, &mut invalid);
        }
        ControlFlow::Loop(spec) => {
            if spec.max_iterations == Some(0) {
                invalid("loop ceiling must be at least 1".to_string());
            }
            check_body(&spec.body, &mut invalid);
        }
    }
    if let Some(body) = control.body() {
        validate_level(body.graph(), is_known_type, errors);
    }
}

fn check_body(body: &SubGraph, invalid: &mut impl FnMut(String)) {
    for entry in &body.entry {
        match body.graph().find_node(entry.node) {
            Some(node) if node.input(&entry.port).is_some() => {}
            Some(_) => invalid(format!("entry port '{}' is not an input", entry.port)),
            None => invalid(format!("entry node {} is not in the body", entry.node)),
        }
    }
    if let Some(exit) = &body.exit {
        match body.graph().find_node(exit.node) {
            Some(node) if node.output(&exit.port).is_some() => {}
            Some(_) => invalid(format!("exit port '{}' is not an output", exit.port)),
            None => invalid(format!("exit node {} is not in the body", exit.node)),
        }
    }
}

/// Build the dependency graph of one level. Node weights are insertion indices,
/// so `NodeIndex::index()` equals the node's position in `graph.nodes`.
pub fn dependency_graph(graph: Graph<'_>) -> DiGraph<usize, ()> {
    let mut dag = DiGraph::with_capacity(graph.nodes.len(), graph.connections.len());
    let mut index = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        index.entry(node.id).or_insert_with(|| dag.add_node(i));
    }
    for conn in graph.connections {
        if let (Some(from), Some(to)) = (index.get(&conn.from_node), index.get(&conn.to_node)) {
            dag.add_edge(*from, *to, ());
        }
    }
    dag
}

/// Deterministic execution order.
///
/// Nodes are emitted level by level: a node's level is its longest dependency
/// depth from a source. Within a level, nodes keep their insertion order.
/// Any nodes left with unresolved in-degree are reported as a cycle.
pub fn topological_order(graph: Graph<'_>) -> Result<Vec<NodeId>, ValidationError> {
    let dag = dependency_graph(graph);
    let n = dag.node_count();
    let mut in_degree: Vec<usize> = (0..n)
        .map(|i| dag.neighbors_directed(NodeIndex::new(i), Direction::Incoming).count())
        .collect();

    let mut order = Vec::with_capacity(n);
    let mut level: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    while !level.is_empty() {
        let mut next = Vec::new();
        for &i in &level {
            order.push(i);
            for succ in dag.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
                let s = succ.index();
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    next.push(s);
                }
            }
        }
        next.sort_unstable();
        level = next;
    }

    if order.len() < n {
        let nodes = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| graph.nodes[dag[NodeIndex::new(i)]].id)
            .collect();
        return Err(ValidationError::Cycle { nodes });
    }

    Ok(order
        .into_iter()
        .map(|i| graph.nodes[dag[NodeIndex::new(i)]].id)
        .collect())
}

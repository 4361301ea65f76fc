//! Dependency-driven scheduling of one graph level, including control flow.
//!
//! A single controller loop owns every status decision. Ready nodes are
//! dispatched into a bounded set of in-flight futures; control-flow nodes run
//! their nested bodies by recursing into a fresh level per pass.

use crate::expr::Resolver;
use crate::isolation::Isolator;
use crate::registry::ComponentRegistry;
use crate::scope::{ExecutionContext, VariableScope};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use latticecore::{
    topological_order, BranchSpec, ComponentContext, ControlFlow, ErrorHandling, EventEmitter,
    ExecutionEvent, FlowError, Graph, IterateSpec, IterationPolicy, LogLevel, LoopMode, LoopSpec,
    NodeError, NodeFailure, NodeId, NodeRunResult, NodeSpec, NodeStatus, PassOutcome, PortAddress,
    SubGraph, Value, WorkflowSettings, ELSE_PORT,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

type Inputs = BTreeMap<String, Value>;
type ActivePorts = Option<HashSet<String>>;

/// Terminal state of one node within one level run
#[derive(Debug, Clone)]
pub struct Settled {
    pub status: NodeStatus,
    pub outputs: Inputs,
    /// Ports a branch node activated; `None` means every port
    pub active_ports: ActivePorts,
    pub error: Option<NodeFailure>,
}

impl Settled {
    fn feeds(&self, port: &str) -> bool {
        self.status == NodeStatus::Success
            && self
                .active_ports
                .as_ref()
                .map_or(true, |ports| ports.contains(port))
    }
}

/// Result of running one level to completion
#[derive(Debug, Default)]
pub struct LevelOutcome {
    pub order: Vec<NodeId>,
    pub settled: HashMap<NodeId, Settled>,
}

impl LevelOutcome {
    /// Every node that was not skipped succeeded
    pub fn succeeded(&self) -> bool {
        self.settled
            .values()
            .all(|s| s.status != NodeStatus::Failed)
    }

    pub fn first_failure(&self) -> Option<(NodeId, NodeFailure)> {
        self.order.iter().find_map(|id| {
            let settled = self.settled.get(id)?;
            match (&settled.status, &settled.error) {
                (NodeStatus::Failed, Some(error)) => Some((*id, error.clone())),
                _ => None,
            }
        })
    }

    pub fn value_at(&self, address: &PortAddress) -> Option<Value> {
        self.settled
            .get(&address.node)
            .filter(|s| s.status == NodeStatus::Success)
            .and_then(|s| s.outputs.get(&address.port).cloned())
    }
}

enum Gate {
    Run(Inputs),
    Skip,
    UpstreamFailed(NodeId),
}

/// Node settled by a dispatched future
struct Finished {
    node_id: NodeId,
    result: NodeRunResult,
    active_ports: ActivePorts,
}

pub struct Scheduler {
    pub registry: Arc<ComponentRegistry>,
    pub isolator: Arc<Isolator>,
    pub events: broadcast::Sender<ExecutionEvent>,
    pub ctx: ExecutionContext,
    pub settings: WorkflowSettings,
    pub max_parallel: usize,
    pub default_timeout: Option<Duration>,
}

impl Scheduler {
    /// Run every node of `graph` (or of `selection`, when given) to a terminal state
    pub fn run_level<'a>(
        &'a self,
        graph: Graph<'a>,
        scope: VariableScope,
        bindings: HashMap<NodeId, Inputs>,
        selection: Option<&'a HashSet<NodeId>>,
    ) -> BoxFuture<'a, Result<LevelOutcome, FlowError>> {
        Box::pin(async move {
            let order: Vec<NodeId> = topological_order(graph)
                .map_err(|e| FlowError::Validation(vec![e]))?
                .into_iter()
                .filter(|id| selection.map_or(true, |s| s.contains(id)))
                .collect();
            let rank: HashMap<NodeId, usize> =
                order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

            let mut waiting: HashMap<NodeId, usize> = order.iter().map(|id| (*id, 0)).collect();
            for conn in graph.connections {
                if rank.contains_key(&conn.from_node) {
                    if let Some(count) = waiting.get_mut(&conn.to_node) {
                        *count += 1;
                    }
                }
            }
            for id in &order {
                if self.ctx.store.status(*id) != Some(NodeStatus::Pending) {
                    self.ctx.store.set_status(*id, NodeStatus::Pending);
                }
            }

            let mut ready: BTreeSet<usize> = order
                .iter()
                .filter(|id| waiting[id] == 0)
                .map(|id| rank[id])
                .collect();
            let mut settled: HashMap<NodeId, Settled> = HashMap::new();
            let mut started: HashSet<NodeId> = HashSet::new();
            let mut running = FuturesUnordered::new();
            let mut halted = false;
            let max_parallel = self.max_parallel.max(1);

            loop {
                if !halted && self.ctx.is_cancelled() {
                    tracing::info!("Run cancelled; skipping nodes that have not started");
                    halted = true;
                }
                if halted {
                    ready.clear();
                    for id in &order {
                        if !started.contains(id) && !settled.contains_key(id) {
                            settled.insert(*id, self.skip(*id));
                        }
                    }
                }

                while running.len() < max_parallel {
                    let Some(position) = ready.pop_first() else {
                        break;
                    };
                    let id = order[position];
                    let Some(node) = graph.find_node(id) else {
                        continue;
                    };
                    started.insert(id);
                    let newly_settled = match self.gate(graph, node, &settled, &rank, &bindings) {
                        Gate::Run(inputs) => {
                            self.ctx.store.set_status(id, NodeStatus::Ready);
                            running.push(self.dispatch(node, scope.clone(), inputs));
                            continue;
                        }
                        Gate::Skip => {
                            tracing::debug!(node_id = %id, "All inbound edges inactive; skipping");
                            self.skip(id)
                        }
                        Gate::UpstreamFailed(upstream) => {
                            let error = NodeError::UpstreamFailed { upstream };
                            self.settle(node, &scope, NodeRunResult::failed(&error, 0), None)
                        }
                    };
                    settled.insert(id, newly_settled);
                    release(graph, id, &rank, &mut waiting, &mut ready);
                }

                if running.is_empty() {
                    if ready.is_empty() {
                        break;
                    }
                    continue;
                }

                tokio::select! {
                    Some(finished) = running.next() => {
                        let Finished { node_id, result, active_ports } = finished;
                        let Some(node) = graph.find_node(node_id) else {
                            continue;
                        };
                        let state = self.settle(node, &scope, result, active_ports);
                        if state.status == NodeStatus::Failed
                            && self.settings.on_error == ErrorHandling::StopWorkflow
                            && !halted
                        {
                            tracing::warn!(node_id = %node_id, "Node failed; stopping dispatch");
                            halted = true;
                        }
                        settled.insert(node_id, state);
                        if !halted {
                            release(graph, node_id, &rank, &mut waiting, &mut ready);
                        }
                    }
                    _ = self.ctx.cancellation.cancelled(), if !halted => {
                        // pending nodes are skipped at the top of the loop
                    }
                }
            }

            Ok(LevelOutcome { order, settled })
        })
    }

    fn gate(
        &self,
        graph: Graph<'_>,
        node: &NodeSpec,
        settled: &HashMap<NodeId, Settled>,
        rank: &HashMap<NodeId, usize>,
        bindings: &HashMap<NodeId, Inputs>,
    ) -> Gate {
        let inbound: Vec<_> = graph
            .incoming(node.id)
            .filter(|c| rank.contains_key(&c.from_node))
            .collect();
        if let Some(conn) = inbound.iter().find(|c| {
            settled
                .get(&c.from_node)
                .is_some_and(|s| s.status == NodeStatus::Failed)
        }) {
            return Gate::UpstreamFailed(conn.from_node);
        }

        let mut inputs = bindings.get(&node.id).cloned().unwrap_or_default();
        let mut any_active = false;
        for conn in &inbound {
            let Some(source) = settled.get(&conn.from_node) else {
                continue;
            };
            if source.feeds(&conn.from_port) {
                any_active = true;
                if let Some(value) = source.outputs.get(&conn.from_port) {
                    inputs.insert(conn.to_port.clone(), value.clone());
                }
            }
        }
        if !inbound.is_empty() && !any_active {
            return Gate::Skip;
        }
        Gate::Run(inputs)
    }

    fn skip(&self, id: NodeId) -> Settled {
        tracing::debug!(node_id = %id, "Skipping node");
        self.ctx.store.set_status(id, NodeStatus::Skipped);
        Settled {
            status: NodeStatus::Skipped,
            outputs: Inputs::new(),
            active_ports: None,
            error: None,
        }
    }

    /// Record a terminal result. Outputs become visible only after the status is stored.
    fn settle(
        &self,
        node: &NodeSpec,
        scope: &VariableScope,
        result: NodeRunResult,
        active_ports: ActivePorts,
    ) -> Settled {
        let status = if result.success {
            NodeStatus::Success
        } else {
            NodeStatus::Failed
        };
        let store = &self.ctx.store;
        store.record_result(node.id, result.clone());
        store.set_status(node.id, status);

        if result.success {
            if !scope.bind_outputs(node, &result.outputs) {
                tracing::warn!(node_id = %node.id, "Outputs already bound in this scope");
            }
            tracing::info!(node_id = %node.id, "Node {} completed in {}ms", node.label(), result.elapsed_ms);
            let _ = self.events.send(ExecutionEvent::NodeCompleted {
                execution_id: self.ctx.execution_id,
                node_id: node.id,
                outputs: result.outputs.clone(),
                duration_ms: result.elapsed_ms,
                timestamp: Utc::now(),
            });
        } else {
            let message = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            tracing::error!(node_id = %node.id, "Node {} failed: {}", node.label(), message);
            store.append_log(node.id, LogLevel::Error, message.clone());
            let _ = self.events.send(ExecutionEvent::NodeFailed {
                execution_id: self.ctx.execution_id,
                node_id: node.id,
                error: message,
                timestamp: Utc::now(),
            });
        }

        Settled {
            status,
            outputs: result.outputs,
            active_ports,
            error: result.error,
        }
    }

    fn dispatch<'a>(
        &'a self,
        node: &'a NodeSpec,
        scope: VariableScope,
        inputs: Inputs,
    ) -> BoxFuture<'a, Finished> {
        Box::pin(async move {
            tracing::debug!(node_id = %node.id, node_type = %node.node_type, "Dispatching node");
            self.ctx.store.set_status(node.id, NodeStatus::Running);
            let log_start = self.ctx.store.log_len(node.id);
            let (mut result, active_ports) = match &node.control {
                None => (self.run_component(node, scope, inputs).await, None),
                Some(ControlFlow::Branch(spec)) => {
                    let (result, active) = self.run_branch(node, spec, &scope, &inputs);
                    (result, Some(active))
                }
                Some(ControlFlow::Iterate(spec)) => {
                    (self.run_iterate(node, spec, scope, inputs).await, None)
                }
                Some(ControlFlow::Loop(spec)) => {
                    (self.run_loop(node, spec, scope, inputs).await, None)
                }
            };
            result.logs = self.ctx.store.logs_since(node.id, log_start);
            Finished {
                node_id: node.id,
                result,
                active_ports,
            }
        })
    }

    fn emitter(&self, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(self.ctx.execution_id, node_id, self.events.clone())
            .with_sink(self.ctx.store.clone())
    }

    fn timeout_for(&self, node: &NodeSpec) -> Option<Duration> {
        node.timeout_ms
            .or(self.settings.max_execution_time_ms)
            .map(Duration::from_millis)
            .or(self.default_timeout)
    }

    async fn run_component(&self, node: &NodeSpec, scope: VariableScope, inputs: Inputs) -> NodeRunResult {
        let started = Instant::now();
        let Some(component) = self.registry.get(&node.node_type) else {
            let error = NodeError::Configuration(format!("Unknown node type: {}", node.node_type));
            return NodeRunResult::failed(&error, 0);
        };
        let node_scope = scope.with_locals([("input".to_string(), Value::Object(inputs.clone()))]);

        let env = match resolve_env(node, &node_scope) {
            Ok(env) => env,
            Err(e) => return NodeRunResult::failed(&e, elapsed(started)),
        };
        let guard = self.ctx.acquire(node.id, env);
        let metadata = component.metadata();
        let properties = match resolve_properties(node, &guard.scope(&node_scope), &metadata.properties) {
            Ok(properties) => properties,
            Err(e) => return NodeRunResult::failed(&e, elapsed(started)),
        };

        let mut ctx = ComponentContext::new(node.id, self.emitter(node.id));
        ctx.requirements = match properties.get("requirements").and_then(Value::as_str) {
            Some(custom) => custom.to_string(),
            None => metadata.requirements,
        };
        ctx.inputs = inputs;
        ctx.properties = properties;
        ctx.env = guard.env().clone();
        ctx.cancellation = self.ctx.cancellation.child_token();

        let result = self
            .isolator
            .invoke(component, ctx, self.timeout_for(node))
            .await;
        drop(guard);
        result
    }

    fn run_branch(
        &self,
        node: &NodeSpec,
        spec: &BranchSpec,
        scope: &VariableScope,
        inputs: &Inputs,
    ) -> (NodeRunResult, HashSet<String>) {
        let started = Instant::now();
        let data = inputs.get("input").cloned().unwrap_or_default();
        let scope = scope.with_locals([
            ("input".to_string(), Value::Object(inputs.clone())),
            ("value".to_string(), data.clone()),
        ]);
        let resolver = Resolver::new(&scope, node.label());

        let mut active = HashSet::new();
        for condition in &spec.conditions {
            match resolver.condition(&condition.name, &condition.expr) {
                Ok(true) => {
                    active.insert(condition.name.clone());
                    if spec.exclusive {
                        break;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    let error = NodeError::from(e);
                    return (NodeRunResult::failed(&error, elapsed(started)), HashSet::new());
                }
            }
        }
        if active.is_empty() && spec.else_branch {
            active.insert(ELSE_PORT.to_string());
        }

        let mut selected: Vec<&str> = active.iter().map(String::as_str).collect();
        selected.sort_unstable();
        self.ctx.store.append_log(
            node.id,
            LogLevel::Info,
            format!("Active branches: [{}]", selected.join(", ")),
        );
        let outputs = active
            .iter()
            .map(|port| (port.clone(), data.clone()))
            .collect();
        (NodeRunResult::succeeded(outputs, elapsed(started)), active)
    }

    async fn run_iterate(
        &self,
        node: &NodeSpec,
        spec: &IterateSpec,
        scope: VariableScope,
        inputs: Inputs,
    ) -> NodeRunResult {
        let started = Instant::now();
        let items = match iteration_items(node, spec, &scope, &inputs) {
            Ok(items) => items,
            Err(e) => return NodeRunResult::failed(&e, elapsed(started)),
        };
        let policy = spec.policy.unwrap_or(self.settings.iteration_policy);
        let total = items.len();
        self.ctx.store.append_log(
            node.id,
            LogLevel::Info,
            format!("Iterating over {} items ({:?})", total, policy),
        );

        let progress = self.emitter(node.id);
        let mut results = Vec::with_capacity(total);
        let mut passes = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            if self.ctx.is_cancelled() {
                return with_passes(NodeRunResult::failed(&NodeError::Cancelled, elapsed(started)), passes);
            }
            let pass_scope = scope.overlay([
                ("item".to_string(), item.clone()),
                ("index".to_string(), Value::from(index)),
                ("data".to_string(), item.clone()),
            ]);
            let level = self
                .run_level(spec.body.graph(), pass_scope, entry_bindings(&spec.body, &item), None)
                .await;
            if self.ctx.is_cancelled() {
                return with_passes(NodeRunResult::failed(&NodeError::Cancelled, elapsed(started)), passes);
            }
            let pass = pass_outcome(index, &spec.body, level);
            if !pass.success {
                self.ctx.store.append_log(
                    node.id,
                    LogLevel::Warn,
                    format!("Item {} failed", index),
                );
            }
            results.push(pass.output.clone());
            passes.push(pass);
            progress.progress(
                (index + 1) as f64 * 100.0 / total as f64,
                Some(format!("item {} of {}", index + 1, total)),
            );
        }

        let failed = passes.iter().filter(|p| !p.success).count();
        if failed > 0 && policy == IterationPolicy::AllOrNothing {
            let error = NodeError::IterationFailed { failed, total };
            return with_passes(NodeRunResult::failed(&error, elapsed(started)), passes);
        }
        let outputs = BTreeMap::from([("results".to_string(), Value::Array(results))]);
        with_passes(NodeRunResult::succeeded(outputs, elapsed(started)), passes)
    }

    async fn run_loop(
        &self,
        node: &NodeSpec,
        spec: &LoopSpec,
        scope: VariableScope,
        inputs: Inputs,
    ) -> NodeRunResult {
        let started = Instant::now();
        let ceiling = spec.max_iterations.unwrap_or(self.settings.loop_ceiling);
        let mut data = inputs.get("input").cloned().unwrap_or_default();
        let mut passes: Vec<PassOutcome> = Vec::new();
        let mut index: u32 = 0;

        loop {
            if self.ctx.is_cancelled() {
                return with_passes(NodeRunResult::failed(&NodeError::Cancelled, elapsed(started)), passes);
            }
            let locals = loop_locals(&data, index, ceiling);
            let proceed = match loop_continues(node, &spec.mode, &scope.with_locals(locals.clone()), index) {
                Ok(proceed) => proceed,
                Err(e) => return with_passes(NodeRunResult::failed(&e, elapsed(started)), passes),
            };
            if !proceed {
                break;
            }
            if index >= ceiling {
                let error = NodeError::LoopCeilingExceeded { ceiling };
                return with_passes(NodeRunResult::failed(&error, elapsed(started)), passes);
            }

            let level = self
                .run_level(spec.body.graph(), scope.overlay(locals), entry_bindings(&spec.body, &data), None)
                .await;
            if self.ctx.is_cancelled() {
                return with_passes(NodeRunResult::failed(&NodeError::Cancelled, elapsed(started)), passes);
            }
            let pass = pass_outcome(index as usize, &spec.body, level);
            if !pass.success {
                let reason = pass
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                passes.push(pass);
                let error = NodeError::ExecutionFailed(format!("pass {} failed: {}", index, reason));
                return with_passes(NodeRunResult::failed(&error, elapsed(started)), passes);
            }
            if spec.body.exit.is_some() {
                data = pass.output.clone();
            }
            passes.push(pass);
            index += 1;
        }

        self.ctx.store.append_log(
            node.id,
            LogLevel::Info,
            format!("Loop finished after {} passes", index),
        );
        let outputs = BTreeMap::from([
            ("output".to_string(), data),
            ("iterations".to_string(), Value::from(index as i64)),
        ]);
        with_passes(NodeRunResult::succeeded(outputs, elapsed(started)), passes)
    }
}

/// Decrement the successors of a settled node and queue the ones that became ready
fn release(
    graph: Graph<'_>,
    id: NodeId,
    rank: &HashMap<NodeId, usize>,
    waiting: &mut HashMap<NodeId, usize>,
    ready: &mut BTreeSet<usize>,
) {
    for conn in graph.outgoing(id) {
        let Some(count) = waiting.get_mut(&conn.to_node) else {
            continue;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            if let Some(position) = rank.get(&conn.to_node) {
                ready.insert(*position);
            }
        }
    }
}

fn elapsed(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn with_passes(mut result: NodeRunResult, passes: Vec<PassOutcome>) -> NodeRunResult {
    result.passes = passes;
    result
}

fn resolve_env(node: &NodeSpec, scope: &VariableScope) -> Result<BTreeMap<String, String>, NodeError> {
    let Some(raw) = node.properties.get("env") else {
        return Ok(BTreeMap::new());
    };
    match Resolver::new(scope, node.label()).resolve("env", raw)? {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, v.render())).collect()),
        other => Err(NodeError::Configuration(format!(
            "env must be a record, got {}",
            other.type_name()
        ))),
    }
}

/// Resolve every property except `env`, filling declared defaults for absent ones
fn resolve_properties(
    node: &NodeSpec,
    scope: &VariableScope,
    definitions: &[latticecore::PropertyDefinition],
) -> Result<Inputs, NodeError> {
    let mut raw: Inputs = node
        .properties
        .iter()
        .filter(|(key, _)| key.as_str() != "env")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for definition in definitions {
        if !definition.default.is_null() {
            raw.entry(definition.name.clone())
                .or_insert_with(|| definition.default.clone());
        }
    }
    Ok(Resolver::new(scope, node.label()).resolve_properties(&raw)?)
}

fn iteration_items(
    node: &NodeSpec,
    spec: &IterateSpec,
    scope: &VariableScope,
    inputs: &Inputs,
) -> Result<Vec<Value>, NodeError> {
    let items = match &spec.items {
        Some(expr) => {
            let scope = scope.with_locals([("input".to_string(), Value::Object(inputs.clone()))]);
            Resolver::new(&scope, node.label()).expression("items", expr)?
        }
        None => inputs.get("items").cloned().unwrap_or_default(),
    };
    match items {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(NodeError::InvalidInputType {
            field: "items".to_string(),
            expected: "list".to_string(),
            actual: other.type_name().to_string(),
        }),
    }
}

fn loop_locals(data: &Value, index: u32, ceiling: u32) -> Vec<(String, Value)> {
    vec![
        ("data".to_string(), data.clone()),
        ("index".to_string(), Value::from(index as i64)),
        ("iteration_count".to_string(), Value::from(index as i64)),
        ("max_iterations".to_string(), Value::from(ceiling as i64)),
    ]
}

fn loop_continues(
    node: &NodeSpec,
    mode: &LoopMode,
    scope: &VariableScope,
    index: u32,
) -> Result<bool, NodeError> {
    match mode {
        LoopMode::Count { times } => Ok(index < *times),
        LoopMode::While { condition } => Ok(Resolver::new(scope, node.label()).condition("condition", condition)?),
    }
}

fn entry_bindings(body: &SubGraph, value: &Value) -> HashMap<NodeId, Inputs> {
    let mut bindings: HashMap<NodeId, Inputs> = HashMap::new();
    for entry in &body.entry {
        bindings
            .entry(entry.node)
            .or_default()
            .insert(entry.port.clone(), value.clone());
    }
    bindings
}

fn pass_outcome(index: usize, body: &SubGraph, level: Result<LevelOutcome, FlowError>) -> PassOutcome {
    match level {
        Ok(level) => {
            let success = level.succeeded();
            PassOutcome {
                index,
                success,
                output: match (&body.exit, success) {
                    (Some(exit), true) => level.value_at(exit).unwrap_or_default(),
                    _ => Value::Null,
                },
                error: level.first_failure().map(|(_, failure)| failure),
            }
        }
        Err(e) => PassOutcome {
            index,
            success: false,
            output: Value::Null,
            error: Some(NodeFailure {
                kind: "execution".to_string(),
                message: e.to_string(),
            }),
        },
    }
}

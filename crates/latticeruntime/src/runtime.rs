use crate::dependency::{DependencyResolver, PackageEnvironment, PipEnvironment};
use crate::export::{bind_interface, ExportError, ExportSpec};
use crate::isolation::Isolator;
use crate::loader::LoadError;
use crate::registry::ComponentRegistry;
use crate::scheduler::Scheduler;
use crate::scope::{ExecutionContext, VariableScope};
use crate::store::StateStore;
use chrono::Utc;
use latticecore::validation::dependency_graph;
use latticecore::{
    validate_with, EventBus, ExecutionEvent, ExecutionId, FlowError, NodeId, NodeReport,
    NodeStatus, ValidationError, Value, Workflow, WorkflowError,
};
use petgraph::graph::NodeIndex;
use petgraph::visit::{Bfs, Reversed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<ComponentRegistry>,
    isolator: Arc<Isolator>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(ComponentRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<ComponentRegistry>, config: RuntimeConfig) -> Self {
        let environment = Arc::new(PipEnvironment::new(config.interpreter.clone()));
        Self::with_environment(registry, environment, config)
    }

    /// Create a runtime whose dependency repairs go to `environment`
    pub fn with_environment(
        registry: Arc<ComponentRegistry>,
        environment: Arc<dyn PackageEnvironment>,
        config: RuntimeConfig,
    ) -> Self {
        let resolver = Arc::new(DependencyResolver::new(environment));
        let isolator = Arc::new(Isolator::new(resolver, config.cancel_grace));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            isolator,
            event_bus,
            config,
        }
    }

    /// Get access to the component registry for registering component types
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        self.isolator.resolver()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Scan every configured component directory
    pub fn load_components(&self) -> Result<usize, LoadError> {
        let mut total = 0;
        for dir in &self.config.component_dirs {
            total += self.registry.scan_dir(dir)?;
        }
        Ok(total)
    }

    /// Structural validation against the registered component types, then
    /// each component's own check of its literal properties
    pub fn validate(&self, workflow: &Workflow) -> Result<(), FlowError> {
        let mut errors = validate_with(workflow.graph(), &|t| self.registry.contains(t));
        for node in workflow.all_nodes() {
            let Some(component) = self.registry.get(&node.node_type) else {
                continue;
            };
            if let Err(e) = component.validate_config(&node.properties) {
                errors.push(ValidationError::InvalidConfig {
                    node_id: node.id,
                    reason: e.to_string(),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Validation(errors))
        }
    }

    /// Execute a whole workflow and wait for the report
    pub async fn execute(&self, workflow: &Workflow, inputs: RunInputs) -> Result<RunReport, FlowError> {
        self.prepare(Arc::new(workflow.clone()), inputs, Selection::All)?
            .run()
            .await
    }

    /// Execute `target` and everything it depends on
    pub async fn run_to(
        &self,
        workflow: &Workflow,
        target: NodeId,
        inputs: RunInputs,
    ) -> Result<RunReport, FlowError> {
        self.prepare(Arc::new(workflow.clone()), inputs, Selection::UpTo(target))?
            .run()
            .await
    }

    /// Execute `start` and everything downstream of it. Edges into the
    /// selection from outside it are ignored.
    pub async fn run_from(
        &self,
        workflow: &Workflow,
        start: NodeId,
        inputs: RunInputs,
    ) -> Result<RunReport, FlowError> {
        self.prepare(Arc::new(workflow.clone()), inputs, Selection::From(start))?
            .run()
            .await
    }

    /// Start a run in the background
    pub fn spawn(&self, workflow: Workflow, inputs: RunInputs) -> Result<ExecutionHandle, FlowError> {
        let run = self.prepare(Arc::new(workflow), inputs, Selection::All)?;
        let execution_id = run.scheduler.ctx.execution_id;
        let store = run.scheduler.ctx.store.clone();
        let scope = run.scheduler.ctx.scope.clone();
        let cancellation = run.scheduler.ctx.cancellation.clone();
        let task = tokio::spawn(run.run());
        Ok(ExecutionHandle {
            execution_id,
            store,
            scope,
            cancellation,
            task,
        })
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn prepare(
        &self,
        workflow: Arc<Workflow>,
        inputs: RunInputs,
        selection: Selection,
    ) -> Result<PreparedRun, FlowError> {
        self.validate(&workflow)?;
        let selection = match selection {
            Selection::All => None,
            Selection::UpTo(target) => Some(reachable(&workflow, target, true)?),
            Selection::From(start) => Some(reachable(&workflow, start, false)?),
        };

        let execution_id = ExecutionId::new_v4();
        let store = Arc::new(StateStore::new(execution_id, self.event_bus.sender()));
        let top_level: HashSet<NodeId> = workflow.nodes.iter().map(|n| n.id).collect();
        for node in workflow.all_nodes() {
            let included = top_level.contains(&node.id)
                && selection.as_ref().map_or(true, |s| s.contains(&node.id));
            let status = if included {
                NodeStatus::Pending
            } else {
                NodeStatus::Idle
            };
            store.register(node, status);
        }

        let scope = VariableScope::new(inputs.environment, inputs.custom);
        let cancellation = CancellationToken::new();
        let ctx = ExecutionContext::new(execution_id, scope, store, cancellation);
        let settings = workflow.settings.clone();
        let max_parallel = settings
            .max_parallel_nodes
            .min(self.config.max_parallel_nodes)
            .max(1);

        Ok(PreparedRun {
            workflow,
            selection,
            bindings: inputs.nodes,
            event_bus: self.event_bus.clone(),
            scheduler: Scheduler {
                registry: self.registry.clone(),
                isolator: self.isolator.clone(),
                events: self.event_bus.sender(),
                ctx,
                settings,
                max_parallel,
                default_timeout: self.config.default_timeout,
            },
        })
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

enum Selection {
    All,
    UpTo(NodeId),
    From(NodeId),
}

/// `origin` plus its ancestors (`upstream`) or its descendants
fn reachable(workflow: &Workflow, origin: NodeId, upstream: bool) -> Result<HashSet<NodeId>, FlowError> {
    let position = workflow
        .nodes
        .iter()
        .position(|n| n.id == origin)
        .ok_or_else(|| WorkflowError::NodeNotFound(origin.to_string()))?;
    let dag = dependency_graph(workflow.graph());
    let start = NodeIndex::new(position);
    let mut found = HashSet::new();
    if upstream {
        let reversed = Reversed(&dag);
        let mut bfs = Bfs::new(reversed, start);
        while let Some(ix) = bfs.next(reversed) {
            found.insert(workflow.nodes[dag[ix]].id);
        }
    } else {
        let mut bfs = Bfs::new(&dag, start);
        while let Some(ix) = bfs.next(&dag) {
            found.insert(workflow.nodes[dag[ix]].id);
        }
    }
    Ok(found)
}

struct PreparedRun {
    workflow: Arc<Workflow>,
    selection: Option<HashSet<NodeId>>,
    bindings: HashMap<NodeId, BTreeMap<String, Value>>,
    event_bus: Arc<EventBus>,
    scheduler: Scheduler,
}

impl PreparedRun {
    async fn run(self) -> Result<RunReport, FlowError> {
        let started = Instant::now();
        let ctx = self.scheduler.ctx.clone();
        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id: ctx.execution_id,
            workflow_id: self.workflow.id,
            timestamp: Utc::now(),
        });
        tracing::info!("Starting workflow execution: {} ({})", self.workflow.name, ctx.execution_id);

        let outcome = self
            .scheduler
            .run_level(
                self.workflow.graph(),
                ctx.scope.clone(),
                self.bindings,
                self.selection.as_ref(),
            )
            .await?;

        let status = if ctx.is_cancelled() {
            RunStatus::Cancelled
        } else if outcome.succeeded() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        self.event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id: ctx.execution_id,
            success: status == RunStatus::Success,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!("Workflow {} finished: {:?} in {}ms", self.workflow.name, status, duration_ms);

        Ok(RunReport {
            execution_id: ctx.execution_id,
            workflow_id: self.workflow.id,
            status,
            nodes: ctx.store.snapshot(),
            duration_ms,
        })
    }
}

/// Caller-supplied values for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInputs {
    #[serde(default)]
    pub environment: BTreeMap<String, Value>,
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
    /// Direct input port bindings, by node id then port
    #[serde(default)]
    pub nodes: HashMap<NodeId, BTreeMap<String, Value>>,
    /// Values for a bundle's interface inputs, by interface name
    #[serde(default)]
    pub interface: BTreeMap<String, Value>,
}

impl RunInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_custom(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(name.into(), value.into());
        self
    }

    pub fn with_input(mut self, node: NodeId, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.nodes
            .entry(node)
            .or_default()
            .insert(port.into(), value.into());
        self
    }

    /// Move `interface` values onto node ports through a bundle interface
    pub fn bind_interface(mut self, spec: &ExportSpec) -> Result<Self, ExportError> {
        let interface = std::mem::take(&mut self.interface);
        for (node, ports) in bind_interface(spec, &interface)? {
            self.nodes.entry(node).or_default().extend(ports);
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

/// The results document of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub workflow_id: uuid::Uuid,
    pub status: RunStatus,
    pub nodes: Vec<NodeReport>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    pub fn status_of(&self, id: NodeId) -> Option<NodeStatus> {
        self.node(id).map(|n| n.status)
    }

    pub fn output(&self, id: NodeId, port: &str) -> Option<&Value> {
        self.node(id)?.result.as_ref()?.outputs.get(port)
    }
}

/// Handle for monitoring and cancelling a background run
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    store: Arc<StateStore>,
    scope: VariableScope,
    cancellation: CancellationToken,
    task: JoinHandle<Result<RunReport, FlowError>>,
}

impl ExecutionHandle {
    /// Request cancellation. Pending nodes are skipped immediately; running
    /// nodes are asked to stop and terminated after the grace period.
    pub fn cancel(&self) {
        tracing::info!(execution_id = %self.execution_id, "Cancellation requested");
        self.cancellation.cancel();
    }

    /// Token that cancels this run; usable after the handle is consumed by `wait`
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn status(&self, node: NodeId) -> Option<NodeStatus> {
        self.store.status(node)
    }

    pub fn snapshot(&self) -> Vec<NodeReport> {
        self.store.snapshot()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Update a custom value; nodes resolved after this call observe it
    pub fn set_custom(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.scope.set_custom(name, value.into());
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<RunReport, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Node budget when neither the node nor the workflow sets one
    pub default_timeout: Option<Duration>,
    /// How long a cancelled node may keep running before it is terminated
    pub cancel_grace: Duration,
    /// Interpreter used for script nodes and dependency repair
    pub interpreter: String,
    pub component_dirs: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            default_timeout: None,
            cancel_grace: Duration::from_secs(2),
            interpreter: "python3".to_string(),
            component_dirs: Vec::new(),
        }
    }
}

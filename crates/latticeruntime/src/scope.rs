//! Variable scopes and the per-run execution context.

use crate::expr::Lookup;
use crate::store::StateStore;
use latticecore::{ExecutionId, NodeId, NodeSpec, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Node outputs bound in one scope level; lookups fall through to the parent
#[derive(Default)]
struct OutputLayer {
    values: RwLock<BTreeMap<String, Value>>,
    parent: Option<Arc<OutputLayer>>,
}

impl OutputLayer {
    fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.values.read().get(key) {
            return Some(value.clone());
        }
        self.parent.as_ref()?.get(key)
    }

    fn collect(&self, into: &mut BTreeMap<String, Value>) {
        if let Some(parent) = &self.parent {
            parent.collect(into);
        }
        into.extend(
            self.values
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
}

/// Layered name environment seen by expressions.
///
/// Precedence: pass-local bindings, then environment, then custom, then node
/// outputs. `env`, `custom` and `nodes` name a whole layer as a record.
#[derive(Clone)]
pub struct VariableScope {
    environment: Arc<BTreeMap<String, Value>>,
    custom: Arc<RwLock<BTreeMap<String, Value>>>,
    outputs: Arc<OutputLayer>,
    locals: Arc<BTreeMap<String, Value>>,
}

impl VariableScope {
    pub fn new(environment: BTreeMap<String, Value>, custom: BTreeMap<String, Value>) -> Self {
        Self {
            environment: Arc::new(environment),
            custom: Arc::new(RwLock::new(custom)),
            outputs: Arc::new(OutputLayer::default()),
            locals: Arc::new(BTreeMap::new()),
        }
    }

    pub fn environment(&self) -> &BTreeMap<String, Value> {
        &self.environment
    }

    /// Caller-side update of a custom value; visible to nodes resolved afterwards
    pub fn set_custom(&self, name: impl Into<String>, value: Value) {
        self.custom.write().insert(name.into(), value);
    }

    pub fn custom(&self, name: &str) -> Option<Value> {
        self.custom.read().get(name).cloned()
    }

    /// Bind a completed node's outputs under its label and its id.
    /// Returns false if this level already holds outputs for the node.
    pub fn bind_outputs(&self, node: &NodeSpec, outputs: &BTreeMap<String, Value>) -> bool {
        let record = Value::Object(outputs.clone());
        let mut values = self.outputs.values.write();
        let id = node.id.to_string();
        if values.contains_key(&id) {
            return false;
        }
        values.insert(id, record.clone());
        values.entry(node.label()).or_insert(record);
        true
    }

    /// Outputs of a node by label or id
    pub fn node_outputs(&self, key: &str) -> Option<Value> {
        self.outputs.get(key)
    }

    /// Child scope for one iteration or loop pass: fresh output level, extra locals
    pub fn overlay(&self, locals: impl IntoIterator<Item = (String, Value)>) -> VariableScope {
        let mut merged = (*self.locals).clone();
        merged.extend(locals);
        VariableScope {
            environment: self.environment.clone(),
            custom: self.custom.clone(),
            outputs: Arc::new(OutputLayer {
                values: RwLock::new(BTreeMap::new()),
                parent: Some(self.outputs.clone()),
            }),
            locals: Arc::new(merged),
        }
    }

    /// Same output level with extra locals, e.g. a node's own `input` record
    pub fn with_locals(&self, locals: impl IntoIterator<Item = (String, Value)>) -> VariableScope {
        let mut merged = (*self.locals).clone();
        merged.extend(locals);
        VariableScope {
            locals: Arc::new(merged),
            ..self.clone()
        }
    }

    /// Environment layer extended with a node's env overlay
    pub fn with_env_overlay(&self, overlay: &BTreeMap<String, String>) -> VariableScope {
        if overlay.is_empty() {
            return self.clone();
        }
        let mut environment = (*self.environment).clone();
        environment.extend(
            overlay
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone()))),
        );
        VariableScope {
            environment: Arc::new(environment),
            ..self.clone()
        }
    }
}

impl Lookup for VariableScope {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.locals.get(name) {
            return Some(value.clone());
        }
        match name {
            "env" => return Some(Value::Object((*self.environment).clone())),
            "custom" => return Some(Value::Object(self.custom.read().clone())),
            "nodes" => {
                let mut all = BTreeMap::new();
                self.outputs.collect(&mut all);
                return Some(Value::Object(all));
            }
            _ => {}
        }
        self.environment
            .get(name)
            .cloned()
            .or_else(|| self.custom(name))
            .or_else(|| self.outputs.get(name))
    }
}

type Overlays = Arc<Mutex<HashMap<NodeId, BTreeMap<String, String>>>>;

/// State owned by one run and passed to every resolver and isolation call
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub scope: VariableScope,
    pub store: Arc<StateStore>,
    pub cancellation: CancellationToken,
    overlays: Overlays,
}

impl ExecutionContext {
    pub fn new(
        execution_id: ExecutionId,
        scope: VariableScope,
        store: Arc<StateStore>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            scope,
            store,
            cancellation,
            overlays: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Install `env` as the overlay of `node_id` until the guard drops
    pub fn acquire(&self, node_id: NodeId, env: BTreeMap<String, String>) -> ScopeGuard {
        self.overlays.lock().insert(node_id, env.clone());
        ScopeGuard {
            node_id,
            env,
            overlays: self.overlays.clone(),
        }
    }

    pub fn active_overlay(&self, node_id: NodeId) -> Option<BTreeMap<String, String>> {
        self.overlays.lock().get(&node_id).cloned()
    }

    /// Number of nodes currently holding an env overlay
    pub fn active_overlays(&self) -> usize {
        self.overlays.lock().len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Holds a node's env overlay; dropping it removes the overlay on every exit path
pub struct ScopeGuard {
    node_id: NodeId,
    env: BTreeMap<String, String>,
    overlays: Overlays,
}

impl ScopeGuard {
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// `base` with this overlay visible through `env.*`
    pub fn scope(&self, base: &VariableScope) -> VariableScope {
        base.with_env_overlay(&self.env)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.overlays.lock().remove(&self.node_id);
    }
}

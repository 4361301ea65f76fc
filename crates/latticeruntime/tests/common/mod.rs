// Shared fixtures for the runtime integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, NodeSpec,
    Value,
};
use latticeruntime::{
    ComponentRegistry, FlowRuntime, InMemoryEnvironment, PackageEnvironment, RuntimeConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Passes `value` through; the `value` property is used when nothing is bound
pub struct Echo;

#[async_trait]
impl Component for Echo {
    fn component_type(&self) -> &str {
        "test.echo"
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .inputs
            .get("value")
            .or_else(|| ctx.properties.get("value"))
            .cloned()
            .unwrap_or_default();
        ctx.events.info(format!("echo {}", value));
        Ok(NodeOutput::new().with_output("value", value))
    }
}

/// `value + amount`
pub struct Add;

#[async_trait]
impl Component for Add {
    fn component_type(&self) -> &str {
        "test.add"
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("value")?.as_f64().unwrap_or(0.0);
        let amount = ctx.get_property_or("amount", Value::from(0.0)).as_f64().unwrap_or(0.0);
        Ok(NodeOutput::new().with_output("value", value + amount))
    }
}

/// Fails when the `when` property is truthy (default: always)
pub struct Fail;

#[async_trait]
impl Component for Fail {
    fn component_type(&self) -> &str {
        "test.fail"
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        if ctx.get_property_or("when", Value::Bool(true)).is_truthy() {
            return Err(NodeError::ExecutionFailed("boom".to_string()));
        }
        let value = ctx.inputs.get("value").cloned().unwrap_or_default();
        Ok(NodeOutput::new().with_output("value", value))
    }
}

pub struct Panics;

#[async_trait]
impl Component for Panics {
    fn component_type(&self) -> &str {
        "test.panic"
    }

    async fn run(&self, _ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        panic!("component exploded");
    }
}

/// Sleeps `ms`, honouring cancellation
pub struct Sleep;

#[async_trait]
impl Component for Sleep {
    fn component_type(&self) -> &str {
        "test.sleep"
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let ms = ctx.get_property_or("ms", Value::from(10.0)).as_f64().unwrap_or(10.0) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }
        let value = ctx.inputs.get("value").cloned().unwrap_or_default();
        Ok(NodeOutput::new().with_output("value", value))
    }
}

/// Sleeps `ms` and ignores cancellation
pub struct Stubborn;

#[async_trait]
impl Component for Stubborn {
    fn component_type(&self) -> &str {
        "test.stubborn"
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let ms = ctx.get_property_or("ms", Value::from(10.0)).as_f64().unwrap_or(10.0) as u64;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(NodeOutput::new())
    }
}

/// Blocks its worker thread for `ms` without yielding
pub struct Blocking;

#[async_trait]
impl Component for Blocking {
    fn component_type(&self) -> &str {
        "test.block"
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let ms = ctx.get_property_or("ms", Value::from(10.0)).as_f64().unwrap_or(10.0) as u64;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(NodeOutput::new())
    }
}

/// Reports the env overlay it was given and its resolved `probe` property
pub struct EnvProbe;

#[async_trait]
impl Component for EnvProbe {
    fn component_type(&self) -> &str {
        "test.env"
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        if ctx.get_property_or("fail", Value::Bool(false)).is_truthy() {
            return Err(NodeError::ExecutionFailed("probe failure".to_string()));
        }
        let env = ctx
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        Ok(NodeOutput::new()
            .with_output("env", Value::Object(env))
            .with_output("probe", ctx.get_property_or("probe", Value::Null)))
    }
}

/// Reports a missing capability for its first `missing` calls
pub struct NeedsPackage {
    pub missing: usize,
    pub requirements: String,
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Component for NeedsPackage {
    fn component_type(&self) -> &str {
        "test.needs"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            requirements: self.requirements.clone(),
            ..ComponentMetadata::default()
        }
    }

    async fn run(&self, _ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.missing {
            return Err(NodeError::MissingCapability(
                "ModuleNotFoundError: No module named 'numpy'".to_string(),
            ));
        }
        Ok(NodeOutput::new().with_output("value", "imported"))
    }
}

pub fn register_test_components(registry: &ComponentRegistry) {
    registry.register(Arc::new(Echo));
    registry.register(Arc::new(Add));
    registry.register(Arc::new(Fail));
    registry.register(Arc::new(Panics));
    registry.register(Arc::new(Sleep));
    registry.register(Arc::new(Stubborn));
    registry.register(Arc::new(Blocking));
    registry.register(Arc::new(EnvProbe));
}

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        cancel_grace: Duration::from_millis(100),
        ..RuntimeConfig::default()
    }
}

pub fn create_runtime() -> FlowRuntime {
    create_runtime_with(Arc::new(InMemoryEnvironment::new()))
}

pub fn create_runtime_with(environment: Arc<dyn PackageEnvironment>) -> FlowRuntime {
    let registry = Arc::new(ComponentRegistry::new());
    register_test_components(&registry);
    FlowRuntime::with_environment(registry, environment, test_config())
}

/// Node with a single `value` input and a single `value` output
pub fn node(node_type: &str, name: &str) -> NodeSpec {
    NodeSpec::new(node_type)
        .with_name(name)
        .with_input("value", DataKind::Any)
        .with_output("value", DataKind::Any)
}

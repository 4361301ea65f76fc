use async_trait::async_trait;
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, PortSpec,
    PropertyDefinition, Value,
};
use std::collections::BTreeMap;
use tokio::time::{sleep, Duration};

/// Delay execution for `delay_ms`, then pass every input through
pub struct DelayNode;

#[async_trait]
impl Component for DelayNode {
    fn component_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![PortSpec::new("value", DataKind::Any)],
            outputs: vec![PortSpec::new("value", DataKind::Any)],
            properties: vec![
                PropertyDefinition::new("delay_ms", DataKind::Number).with_default(1000.0)
            ],
            ..ComponentMetadata::default()
        }
    }

    fn validate_config(&self, properties: &BTreeMap<String, Value>) -> Result<(), NodeError> {
        match properties.get("delay_ms") {
            Some(Value::Number(ms)) if *ms < 0.0 => Err(NodeError::Configuration(
                "delay_ms must be a non-negative number".to_string(),
            )),
            Some(Value::Bool(_) | Value::Array(_) | Value::Object(_)) => Err(NodeError::Configuration(
                "delay_ms must be a number".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .get_property_or("delay_ms", Value::from(1000.0))
            .as_f64()
            .filter(|ms| *ms >= 0.0)
            .ok_or_else(|| NodeError::Configuration("delay_ms must be a non-negative number".to_string()))?
            as u64;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        Ok(NodeOutput { outputs: ctx.inputs })
    }
}

use async_trait::async_trait;
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, PortSpec,
    PropertyDefinition, Value,
};

/// Logs its `message` property (or input) and every other input into the node log
pub struct DebugNode;

#[async_trait]
impl Component for DebugNode {
    fn component_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortSpec::new("value", DataKind::Any)],
            outputs: vec![
                PortSpec::new("message", DataKind::Text),
                PortSpec::new("value", DataKind::Any),
            ],
            properties: vec![PropertyDefinition::new("message", DataKind::Text)],
            ..ComponentMetadata::default()
        }
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .properties
            .get("message")
            .or_else(|| ctx.inputs.get("message"))
            .map(Value::render)
            .unwrap_or_else(|| "(no message)".to_string());

        ctx.events.info(format!("DEBUG: {}", message));
        for (key, value) in &ctx.inputs {
            ctx.events.info(format!("  {}: {}", key, value.to_json()));
        }

        let value = ctx.inputs.get("value").cloned().unwrap_or_default();
        Ok(NodeOutput::new()
            .with_output("message", message)
            .with_output("value", value))
    }
}

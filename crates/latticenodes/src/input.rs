use async_trait::async_trait;
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, PortSpec,
    PropertyDefinition,
};

/// Emits a constant. A value bound to the `value` input port wins over the property.
pub struct InputNode;

#[async_trait]
impl Component for InputNode {
    fn component_type(&self) -> &str {
        "input.value"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Provide a constant or caller-supplied value".to_string(),
            category: "input".to_string(),
            inputs: vec![PortSpec::new("value", DataKind::Any)],
            outputs: vec![PortSpec::new("value", DataKind::Any)],
            properties: vec![PropertyDefinition::new("value", DataKind::Any)],
            ..ComponentMetadata::default()
        }
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .inputs
            .get("value")
            .or_else(|| ctx.properties.get("value"))
            .cloned()
            .unwrap_or_default();
        Ok(NodeOutput::new().with_output("value", value))
    }
}

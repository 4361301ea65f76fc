use async_trait::async_trait;
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, PortSpec,
    PropertyDefinition, Value,
};

/// Parse a JSON string into a value
pub struct JsonParseNode;

#[async_trait]
impl Component for JsonParseNode {
    fn component_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortSpec::new("json", DataKind::Text)],
            outputs: vec![PortSpec::new("parsed", DataKind::Any)],
            ..ComponentMetadata::default()
        }
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let raw = ctx.require_input("json")?;
        let input = raw.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "json".to_string(),
            expected: "string".to_string(),
            actual: raw.type_name().to_string(),
        })?;

        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new().with_output("parsed", Value::from(parsed)))
    }
}

/// Render a value as JSON text
pub struct JsonStringifyNode;

#[async_trait]
impl Component for JsonStringifyNode {
    fn component_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortSpec::new("value", DataKind::Any)],
            outputs: vec![PortSpec::new("json", DataKind::Text)],
            properties: vec![PropertyDefinition::new("pretty", DataKind::Boolean).with_default(false)],
            ..ComponentMetadata::default()
        }
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("value")?.to_json();
        let pretty = ctx.get_property_or("pretty", Value::Bool(false)).is_truthy();

        let json_str = if pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output("json", json_str))
    }
}

use async_trait::async_trait;
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, PortSpec,
    PropertyDefinition, Value,
};
use std::collections::BTreeMap;

const SUPPORTED_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for HttpRequestNode {
    fn component_type(&self) -> &str {
        "http.request"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            inputs: vec![
                PortSpec::new("url", DataKind::Text),
                PortSpec::new("body", DataKind::Any),
            ],
            outputs: vec![
                PortSpec::new("status", DataKind::Number),
                PortSpec::new("body", DataKind::Text),
                PortSpec::new("headers", DataKind::Record),
            ],
            properties: vec![
                PropertyDefinition::new("url", DataKind::Text),
                PropertyDefinition::new("method", DataKind::Text).with_default("GET"),
                PropertyDefinition::new("headers", DataKind::Record),
            ],
            ..ComponentMetadata::default()
        }
    }

    fn validate_config(&self, properties: &BTreeMap<String, Value>) -> Result<(), NodeError> {
        match properties.get("method").and_then(Value::as_str) {
            Some(method) if !method.contains('$') && !SUPPORTED_METHODS.contains(&method.to_uppercase().as_str()) => {
                Err(NodeError::Configuration(format!("Unsupported method: {}", method)))
            }
            _ => Ok(()),
        }
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let url_value = ctx
            .inputs
            .get("url")
            .or_else(|| ctx.properties.get("url"))
            .ok_or_else(|| NodeError::MissingInput("url".to_string()))?;
        let url = url_value.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "url".to_string(),
            expected: "string".to_string(),
            actual: url_value.type_name().to_string(),
        })?;
        let method_value = ctx.get_property_or("method", Value::from("GET"));
        let method = method_value.as_str().unwrap_or("GET").to_uppercase();

        ctx.events.info(format!("{} {}", method, url));

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            _ => return Err(NodeError::Configuration(format!("Unsupported method: {}", method))),
        };
        match ctx.inputs.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(other) => request = request.json(&other.to_json()),
        }
        if let Some(Value::Object(headers)) = ctx.properties.get("headers") {
            for (key, value) in headers {
                request = request.header(key, value.render());
            }
        }

        let response = tokio::select! {
            sent = request.send() => sent
                .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?,
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        };

        let status = response.status().as_u16();
        let headers: BTreeMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(v.to_str().unwrap_or(""))))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status));

        Ok(NodeOutput::new()
            .with_output("status", status as f64)
            .with_output("body", body)
            .with_output("headers", Value::Object(headers)))
    }
}

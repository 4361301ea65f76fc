use async_trait::async_trait;
use latticecore::{
    Component, ComponentContext, ComponentMetadata, DataKind, NodeError, NodeOutput, PortSpec,
    PropertyDefinition, Value,
};
use latticeruntime::{ProcessCommand, ProcessRunner};

/// Freeform script executed as a child process.
///
/// The script reads `{"params": ..., "inputs": ...}` from stdin and writes a
/// JSON object of outputs to the file named by `LATTICE_RESULT_PATH`.
pub struct ScriptNode {
    runner: ProcessRunner,
    interpreter: String,
}

impl ScriptNode {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            runner: ProcessRunner::new(),
            interpreter: interpreter.into(),
        }
    }
}

impl Default for ScriptNode {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl Component for ScriptNode {
    fn component_type(&self) -> &str {
        "script.run"
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Run inline script code in a separate process".to_string(),
            category: "script".to_string(),
            inputs: vec![PortSpec::new("input", DataKind::Any)],
            outputs: vec![PortSpec::new("output", DataKind::Any)],
            properties: vec![
                PropertyDefinition::new("code", DataKind::Text),
                PropertyDefinition::new("interpreter", DataKind::Text),
                PropertyDefinition::new("requirements", DataKind::Text),
            ],
            ..ComponentMetadata::default()
        }
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let code = ctx
            .require_property("code")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("code must be text".to_string()))?;
        let interpreter = ctx
            .properties
            .get("interpreter")
            .and_then(Value::as_str)
            .unwrap_or(&self.interpreter);
        let file_name = if interpreter.contains("python") {
            "script.py"
        } else {
            "script"
        };

        let command = ProcessCommand::new(interpreter).with_script(file_name, code);
        self.runner.run(&command, &ctx).await
    }
}

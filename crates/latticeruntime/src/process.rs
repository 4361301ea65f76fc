//! Child-process execution for manifest components and freeform scripts.
//!
//! The child gets a cleared environment, a private temp working directory and
//! its parameters as JSON on stdin. It reports outputs by writing a JSON
//! object to the file named by `LATTICE_RESULT_PATH`.

use latticecore::{ComponentContext, NodeError, NodeOutput, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

pub const RESULT_PATH_VAR: &str = "LATTICE_RESULT_PATH";

/// Failure output that indicates a missing third-party capability
pub const MISSING_CAPABILITY_MARKERS: &[&str] =
    &["ModuleNotFoundError", "ImportError", "No module named"];

const STDERR_TAIL: usize = 20;

pub fn is_missing_capability(text: &str) -> bool {
    MISSING_CAPABILITY_MARKERS.iter().any(|m| text.contains(m))
}

/// Source text written into the working directory and passed as the last argument
#[derive(Debug, Clone)]
pub struct InlineScript {
    pub file_name: String,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub script: Option<InlineScript>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            script: None,
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_script(mut self, file_name: impl Into<String>, code: impl Into<String>) -> Self {
        self.script = Some(InlineScript {
            file_name: file_name.into(),
            code: code.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` for one invocation. Dropping the returned future kills the child.
    pub async fn run(
        &self,
        command: &ProcessCommand,
        ctx: &ComponentContext,
    ) -> Result<NodeOutput, NodeError> {
        let io_error = |what: &str, e: std::io::Error| {
            NodeError::ExecutionFailed(format!("{} for '{}': {}", what, command.program, e))
        };

        let workdir = tempfile::tempdir().map_err(|e| io_error("Failed to create workdir", e))?;
        let result_path = workdir.path().join("result.json");

        let mut args = command.args.clone();
        if let Some(script) = &command.script {
            let path = workdir.path().join(&script.file_name);
            tokio::fs::write(&path, &script.code)
                .await
                .map_err(|e| io_error("Failed to write script", e))?;
            args.push(path.to_string_lossy().into_owned());
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&args)
            .current_dir(command.working_dir.as_deref().unwrap_or(workdir.path()))
            .env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", workdir.path())
            .envs(&ctx.env)
            .env(RESULT_PATH_VAR, &result_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(node_id = %ctx.node_id, program = %command.program, "Spawning process");
        let mut child = cmd.spawn().map_err(|e| io_error("Failed to spawn", e))?;

        let payload = serde_json::json!({
            "params": to_json(&ctx.properties),
            "inputs": to_json(&ctx.inputs),
        });
        if let Some(mut stdin) = child.stdin.take() {
            // A child that never reads stdin closes the pipe early
            if let Err(e) = stdin.write_all(payload.to_string().as_bytes()).await {
                tracing::debug!(node_id = %ctx.node_id, "stdin not consumed: {}", e);
            }
            drop(stdin);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_events = ctx.events.clone();
        let err_events = ctx.events.clone();
        let pump_out = async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    out_events.info(line);
                }
            }
        };
        let pump_err = async move {
            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    err_events.warn(line.clone());
                    if tail.len() == STDERR_TAIL {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail
        };
        let cancel = ctx.cancellation.clone();
        let wait = async {
            tokio::select! {
                status = child.wait() => status.map(Some),
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    Ok(None)
                }
            }
        };

        let ((), tail, status) = tokio::join!(pump_out, pump_err, wait);
        let status = match status {
            Ok(Some(status)) => status,
            Ok(None) => return Err(NodeError::Cancelled),
            Err(e) => return Err(io_error("Failed to wait", e)),
        };

        let stderr_text = tail.join("\n");
        if !status.success() {
            if is_missing_capability(&stderr_text) {
                return Err(NodeError::MissingCapability(
                    tail.last().cloned().unwrap_or_default(),
                ));
            }
            return Err(NodeError::ExecutionFailed(format!(
                "process exited with {}: {}",
                status,
                tail.last().map(String::as_str).unwrap_or("")
            )));
        }

        let outputs = match tokio::fs::read_to_string(&result_path).await {
            Ok(text) => parse_result(&text)?,
            // A script that caught its own import error may still exit cleanly
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if is_missing_capability(&stderr_text) {
                    return Err(NodeError::MissingCapability(
                        tail.last().cloned().unwrap_or_default(),
                    ));
                }
                BTreeMap::new()
            }
            Err(e) => return Err(io_error("Failed to read result", e)),
        };
        if let Some(Value::String(error)) = outputs.get("error") {
            if is_missing_capability(error) {
                return Err(NodeError::MissingCapability(error.clone()));
            }
        }
        Ok(NodeOutput { outputs })
    }
}

fn to_json(values: &BTreeMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(
        values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

fn parse_result(text: &str) -> Result<BTreeMap<String, Value>, NodeError> {
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| NodeError::ExecutionFailed(format!("Invalid result document: {}", e)))?;
    match Value::from(json) {
        Value::Object(outputs) => Ok(outputs),
        other => Err(NodeError::ExecutionFailed(format!(
            "Result document must be an object, got {}",
            other.type_name()
        ))),
    }
}

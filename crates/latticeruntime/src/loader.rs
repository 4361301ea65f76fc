//! Discovery of process components from manifest files.

use crate::process::{ProcessCommand, ProcessRunner};
use crate::registry::ComponentSource;
use async_trait::async_trait;
use latticecore::{Component, ComponentContext, ComponentMetadata, NodeError, NodeOutput};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_SUFFIX: &str = ".component.json";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid manifest {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// On-disk description of a process component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentManifest {
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(flatten)]
    pub metadata: ComponentMetadata,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Script file relative to the manifest, appended to the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
}

/// Component whose logic runs as a child process
pub struct ProcessComponent {
    manifest: ComponentManifest,
    base_dir: PathBuf,
    runner: ProcessRunner,
}

impl ProcessComponent {
    pub fn new(manifest: ComponentManifest, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            base_dir: base_dir.into(),
            runner: ProcessRunner::new(),
        }
    }

    pub fn manifest(&self) -> &ComponentManifest {
        &self.manifest
    }

    fn command(&self) -> Result<ProcessCommand, NodeError> {
        let (program, args) = self.manifest.command.split_first().ok_or_else(|| {
            NodeError::Configuration(format!("{} has an empty command", self.manifest.component_type))
        })?;
        let mut command = ProcessCommand::new(program.clone());
        command.args = args.to_vec();
        if let Some(script) = &self.manifest.script {
            command
                .args
                .push(self.base_dir.join(script).to_string_lossy().into_owned());
        }
        Ok(command)
    }
}

#[async_trait]
impl Component for ProcessComponent {
    fn component_type(&self) -> &str {
        &self.manifest.component_type
    }

    fn metadata(&self) -> ComponentMetadata {
        self.manifest.metadata.clone()
    }

    async fn run(&self, ctx: ComponentContext) -> Result<NodeOutput, NodeError> {
        let command = self.command()?;
        self.runner.run(&command, &ctx).await
    }
}

/// Parse every manifest in `dir` (not recursive), in file-name order
pub fn scan_dir(dir: &Path) -> Result<Vec<(ProcessComponent, ComponentSource)>, LoadError> {
    let io = |path: &Path, source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| io(dir, e))? {
        let path = entry.map_err(|e| io(dir, e))?.path();
        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
        if is_manifest && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut found = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|e| io(&path, e))?;
        let manifest: ComponentManifest =
            serde_json::from_str(&text).map_err(|source| LoadError::Manifest {
                path: path.clone(),
                source,
            })?;
        let invalid = |reason: &str| LoadError::Invalid {
            path: path.clone(),
            reason: reason.to_string(),
        };
        if manifest.component_type.trim().is_empty() {
            return Err(invalid("missing component type"));
        }
        if manifest.command.is_empty() {
            return Err(invalid("missing command"));
        }

        let mut files = vec![PathBuf::from(path.file_name().unwrap_or_default())];
        if let Some(script) = &manifest.script {
            if script.is_absolute() || !dir.join(script).is_file() {
                return Err(invalid("script must be an existing file next to the manifest"));
            }
            files.push(script.clone());
        }
        tracing::debug!(path = %path.display(), component = %manifest.component_type, "Loaded manifest");
        found.push((
            ProcessComponent::new(manifest, dir),
            ComponentSource {
                root: dir.to_path_buf(),
                files,
            },
        ));
    }
    Ok(found)
}

//! Third-party capability checks and repair.

use async_trait::async_trait;
use latticecore::EventEmitter;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DependencyError {
    #[error("Invalid requirement '{0}'")]
    InvalidRequirement(String),

    #[error("Failed to install '{requirement}': {detail}")]
    InstallFailed { requirement: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOp {
    Eq,
    NotEq,
    GtEq,
    LtEq,
    Gt,
    Lt,
    Compatible,
}

impl VersionOp {
    fn as_str(self) -> &'static str {
        match self {
            VersionOp::Eq => "==",
            VersionOp::NotEq => "!=",
            VersionOp::GtEq => ">=",
            VersionOp::LtEq => "<=",
            VersionOp::Gt => ">",
            VersionOp::Lt => "<",
            VersionOp::Compatible => "~=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub op: VersionOp,
    pub version: String,
}

impl Constraint {
    pub fn matches(&self, installed: &str) -> bool {
        let ordering = compare_versions(installed, &self.version);
        match self.op {
            VersionOp::Eq => ordering == Ordering::Equal,
            VersionOp::NotEq => ordering != Ordering::Equal,
            VersionOp::GtEq => ordering != Ordering::Less,
            VersionOp::LtEq => ordering != Ordering::Greater,
            VersionOp::Gt => ordering == Ordering::Greater,
            VersionOp::Lt => ordering == Ordering::Less,
            VersionOp::Compatible => {
                // ~=1.4.2 means >=1.4.2 and ==1.4.*
                let wanted = version_parts(&self.version);
                let have = version_parts(installed);
                let prefix = wanted.len().saturating_sub(1).max(1);
                ordering != Ordering::Less
                    && (0..prefix).all(|i| have.get(i).copied().unwrap_or(0) == wanted[i])
            }
        }
    }
}

impl Constraint {
    /// `>=1.20` and friends; `None` when there is no operator or no version
    fn parse(text: &str) -> Option<Self> {
        let ops = [
            ("==", VersionOp::Eq),
            ("!=", VersionOp::NotEq),
            (">=", VersionOp::GtEq),
            ("<=", VersionOp::LtEq),
            ("~=", VersionOp::Compatible),
            (">", VersionOp::Gt),
            ("<", VersionOp::Lt),
        ];
        let (op, version) = ops
            .iter()
            .find_map(|(symbol, op)| text.trim().strip_prefix(symbol).map(|v| (*op, v.trim())))?;
        if version.is_empty() || version_parts(version).is_empty() {
            return None;
        }
        Some(Constraint {
            op,
            version: version.to_string(),
        })
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// One named capability with optional version constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraints: Vec<Constraint>,
}

impl Requirement {
    pub fn parse(raw: &str) -> Result<Self, DependencyError> {
        let raw = raw.trim();
        let invalid = || DependencyError::InvalidRequirement(raw.to_string());
        let split = raw
            .find(|c: char| matches!(c, '=' | '!' | '<' | '>' | '~'))
            .unwrap_or(raw.len());
        let name = raw[..split].trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid());
        }
        let rest = raw[split..].trim();
        let mut constraints = Vec::new();
        if !rest.is_empty() {
            constraints.push(Constraint::parse(rest).ok_or_else(invalid)?);
        }
        Ok(Self {
            name: name.to_string(),
            constraints,
        })
    }

    /// Name used to merge entries: case-insensitive, `-` and `_` equivalent
    pub fn normalized_name(&self) -> String {
        normalize(&self.name)
    }

    pub fn is_satisfied_by(&self, installed: &str) -> bool {
        self.constraints.iter().all(|c| c.matches(installed))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        let constraints: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        f.write_str(&constraints.join(","))
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}

fn starts_with_op(item: &str) -> bool {
    item.starts_with(|c: char| matches!(c, '=' | '!' | '<' | '>' | '~'))
}

/// Parse a comma-separated requirement list; blank entries are ignored.
///
/// A piece that is only a constraint (`numpy>=1.20,<2`) belongs to the
/// requirement before it on the same line.
pub fn parse_requirements(spec: &str) -> Result<Vec<Requirement>, DependencyError> {
    let mut requirements: Vec<Requirement> = Vec::new();
    for line in spec.lines().map(str::trim) {
        if line.starts_with('#') {
            continue;
        }
        let line_start = requirements.len();
        for item in line.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            if !starts_with_op(item) {
                requirements.push(Requirement::parse(item)?);
                continue;
            }
            let invalid = || DependencyError::InvalidRequirement(item.to_string());
            if requirements.len() == line_start {
                return Err(invalid());
            }
            let constraint = Constraint::parse(item).ok_or_else(invalid)?;
            if let Some(last) = requirements.last_mut() {
                last.constraints.push(constraint);
            }
        }
    }
    Ok(requirements)
}

fn version_parts(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map_while(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Dotted numeric comparison; missing components count as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (version_parts(a), version_parts(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0)))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Consolidated, de-duplicated requirement list of a bundle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub requirements: Vec<Requirement>,
}

impl Manifest {
    /// Merge requirement lists by normalized name, keeping first-seen order
    pub fn merge<'a>(specs: impl IntoIterator<Item = &'a str>) -> Result<Self, DependencyError> {
        let mut manifest = Manifest::default();
        for spec in specs {
            for requirement in parse_requirements(spec)? {
                manifest.add(requirement);
            }
        }
        Ok(manifest)
    }

    pub fn add(&mut self, requirement: Requirement) {
        let key = requirement.normalized_name();
        match self
            .requirements
            .iter_mut()
            .find(|r| r.normalized_name() == key)
        {
            Some(existing) => {
                for constraint in requirement.constraints {
                    if !existing.constraints.contains(&constraint) {
                        existing.constraints.push(constraint);
                    }
                }
            }
            None => self.requirements.push(requirement),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// `requirements.txt` form, one requirement per line
    pub fn render(&self) -> String {
        self.requirements
            .iter()
            .map(|r| format!("{}\n", r))
            .collect()
    }
}

/// The package mechanism of the environment components run in
#[async_trait]
pub trait PackageEnvironment: Send + Sync {
    async fn installed_version(&self, name: &str) -> Option<String>;

    /// Install `requirement`, streaming installer output to `log`
    async fn install(&self, requirement: &Requirement, log: &EventEmitter)
        -> Result<(), DependencyError>;
}

/// Environment backed by `<interpreter> -m pip`
pub struct PipEnvironment {
    interpreter: String,
}

impl PipEnvironment {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

#[async_trait]
impl PackageEnvironment for PipEnvironment {
    async fn installed_version(&self, name: &str) -> Option<String> {
        let output = Command::new(&self.interpreter)
            .args(["-m", "pip", "show", name])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|line| line.strip_prefix("Version:"))
            .map(|v| v.trim().to_string())
    }

    async fn install(
        &self,
        requirement: &Requirement,
        log: &EventEmitter,
    ) -> Result<(), DependencyError> {
        let spec = requirement.to_string();
        let failed = |detail: String| DependencyError::InstallFailed {
            requirement: spec.clone(),
            detail,
        };
        log.info(format!("Installing {}", spec));
        let mut child = Command::new(&self.interpreter)
            .args(["-m", "pip", "install", &spec])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_log = log.clone();
        let err_log = log.clone();
        let pump_out = async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    out_log.info(line);
                }
            }
        };
        let pump_err = async move {
            let mut tail = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    err_log.warn(line.clone());
                    tail = line;
                }
            }
            tail
        };
        let ((), tail) = tokio::join!(pump_out, pump_err);
        let status = child.wait().await.map_err(|e| failed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(failed(format!("installer exited with {}: {}", status, tail)))
        }
    }
}

/// In-process package environment with a fixed catalogue
#[derive(Default)]
pub struct InMemoryEnvironment {
    installed: Mutex<BTreeMap<String, String>>,
    available: BTreeMap<String, String>,
    installs: AtomicUsize,
}

impl InMemoryEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Package that is already present
    pub fn with_installed(self, name: &str, version: &str) -> Self {
        self.installed.lock().insert(normalize(name), version.to_string());
        self
    }

    /// Package that `install` can provide
    pub fn with_available(mut self, name: &str, version: &str) -> Self {
        self.available.insert(normalize(name), version.to_string());
        self
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl PackageEnvironment for InMemoryEnvironment {
    async fn installed_version(&self, name: &str) -> Option<String> {
        self.installed.lock().get(&normalize(name)).cloned()
    }

    async fn install(
        &self,
        requirement: &Requirement,
        log: &EventEmitter,
    ) -> Result<(), DependencyError> {
        self.installs.fetch_add(1, AtomicOrdering::SeqCst);
        let key = requirement.normalized_name();
        match self.available.get(&key) {
            Some(version) if requirement.is_satisfied_by(version) => {
                log.info(format!("Installed {} {}", requirement.name, version));
                self.installed.lock().insert(key, version.clone());
                Ok(())
            }
            _ => Err(DependencyError::InstallFailed {
                requirement: requirement.to_string(),
                detail: "no matching distribution".to_string(),
            }),
        }
    }
}

/// What one `ensure` call did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairReport {
    pub installed: Vec<Requirement>,
    pub satisfied: Vec<Requirement>,
}

impl RepairReport {
    /// Whether anything changed, i.e. whether a retry can behave differently
    pub fn repaired(&self) -> bool {
        !self.installed.is_empty()
    }
}

pub struct DependencyResolver {
    environment: Arc<dyn PackageEnvironment>,
    calls: AtomicUsize,
}

impl DependencyResolver {
    pub fn new(environment: Arc<dyn PackageEnvironment>) -> Self {
        Self {
            environment,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `ensure` invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    /// Make every requirement in `spec` satisfiable. Already satisfied
    /// requirements are left alone, so repeated calls are no-ops.
    pub async fn ensure(
        &self,
        spec: &str,
        log: &EventEmitter,
    ) -> Result<RepairReport, DependencyError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        let mut report = RepairReport::default();
        for requirement in parse_requirements(spec)? {
            match self.environment.installed_version(&requirement.name).await {
                Some(version) if requirement.is_satisfied_by(&version) => {
                    tracing::debug!(requirement = %requirement, %version, "Requirement satisfied");
                    report.satisfied.push(requirement);
                }
                installed => {
                    if let Some(version) = installed {
                        log.warn(format!(
                            "{} {} does not satisfy {}",
                            requirement.name, version, requirement
                        ));
                    }
                    self.environment.install(&requirement, log).await?;
                    tracing::info!(requirement = %requirement, "Requirement installed");
                    report.installed.push(requirement);
                }
            }
        }
        Ok(report)
    }
}

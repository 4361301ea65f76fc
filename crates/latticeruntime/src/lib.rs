//! Workflow execution runtime
//!
//! This crate provides the execution engine that runs workflows: the
//! expression resolver, the scheduler with its control-flow handling, node
//! isolation with dependency repair, the per-run state store, the component
//! registry and subgraph export.

pub mod dependency;
pub mod export;
pub mod expr;
mod isolation;
pub mod loader;
mod process;
mod registry;
mod runtime;
mod scheduler;
mod scope;
mod store;

pub use dependency::{
    DependencyError, DependencyResolver, InMemoryEnvironment, Manifest, PackageEnvironment,
    PipEnvironment, RepairReport, Requirement,
};
pub use export::{export, infer_interface, Bundle, ExportError, ExportSpec, InterfacePort};
pub use isolation::Isolator;
pub use loader::{ComponentManifest, LoadError, ProcessComponent};
pub use process::{is_missing_capability, ProcessCommand, ProcessRunner, RESULT_PATH_VAR};
pub use registry::{ComponentRegistry, ComponentSource};
pub use runtime::{ExecutionHandle, FlowRuntime, RunInputs, RunReport, RunStatus, RuntimeConfig};
pub use scheduler::{LevelOutcome, Scheduler, Settled};
pub use scope::{ExecutionContext, ScopeGuard, VariableScope};
pub use store::{EdgeState, StateStore, StatusChange};

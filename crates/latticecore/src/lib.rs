//! Core abstractions for the lattice workflow engine
//!
//! This crate provides the graph document, the value model, the component
//! contract, static validation and the event types that every other crate
//! depends on. It does not execute anything.

mod component;
mod error;
pub mod events;
mod status;
pub mod validation;
mod value;
mod workflow;

pub use component::{
    Component, ComponentContext, ComponentMetadata, NodeOutput, PropertyDefinition,
};
pub use error::{EvaluationError, FlowError, NodeError, WorkflowError};
pub use events::*;
pub use status::{
    LogLevel, LogLine, NodeFailure, NodeReport, NodeRunResult, NodeStatus, PassOutcome,
};
pub use validation::{topological_order, validate, validate_with, ValidationError};
pub use value::Value;
pub use workflow::{
    sanitize_identifier, BranchCondition, BranchSpec, Connection, ControlFlow, DataKind,
    ErrorHandling, Graph, IterateSpec, IterationPolicy, LoopMode, LoopSpec, NodeId, NodeSpec,
    PortAddress, PortSpec, Position, SubGraph, Workflow, WorkflowId, WorkflowSettings,
    BRANCH_NODE_TYPE, ELSE_PORT, ITERATE_NODE_TYPE, LOOP_NODE_TYPE,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

//! Core abstractions for the flow execution engine
//!
//! This crate provides the execution data model (graph, statuses, properties,
//! conditions), the events it emits and the traits of the collaborators the
//! engine talks to. It has no runtime behaviour of its own.

mod condition;
mod definition;
mod error;
pub mod events;
mod graph;
mod job;
mod loader;
mod options;
mod props;
mod status;

pub use condition::{Clause, Comparison, ConditionOnJobStatus, ConditionOutcome, PropertyCondition};
pub use definition::{FlowDefinition, NodeDefinition, SharedProps, FLOW_NODE_TYPE};
pub use error::{ConditionError, ExecutorError, JobError, WorkflowError};
pub use events::*;
pub use graph::{Attempt, ExecutableGraph, ExecutableNode, NodeId, NodeKind, NESTED_ID_SEPARATOR};
pub use job::{Job, JobContext, JobLog};
pub use loader::{ExecutorLoader, ProjectLoader};
pub use options::{ExecutionOptions, FailureAction, PipelineLevel};
pub use props::Props;
pub use status::Status;

/// Identifier of one flow execution
pub type ExecutionId = u64;

/// Result type for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

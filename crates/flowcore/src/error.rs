use crate::ExecutionId;
use thiserror::Error;

/// Errors surfaced to callers of the executor: admission, operator actions and
/// collaborator failures.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Execution {0} is already running")]
    AlreadyRunning(ExecutionId),

    #[error("Execution {0} is not running")]
    NotRunning(ExecutionId),

    #[error("Execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("Execution {0} was claimed by another executor")]
    AlreadyClaimed(ExecutionId),

    #[error("Executor can't execute any more flows ({running} running, {queued} queued)")]
    Saturated { running: usize, queued: usize },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Executor is shutting down")]
    ShuttingDown,

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Project error: {0}")]
    Project(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a single job attempt. The message ends up on the node.
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("Missing required property: {0}")]
    MissingProperty(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Proxy user {user} is not allowed")]
    ProxyUser { user: String },

    #[error("Cancelled")]
    Cancelled,
}

/// Problems with a flow definition or the graph built from it.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid flow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected in flow {0}")]
    CyclicDependency(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid condition on {node}: {source}")]
    Condition {
        node: String,
        #[source]
        source: ConditionError,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("cannot parse condition '{expression}' at {position}: {message}")]
    Parse {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("condition references {0}, which is not a direct predecessor")]
    UnknownPredecessor(String),
}

//! Collaborators the engine depends on but does not implement itself

use crate::{ExecutableGraph, ExecutionId, ExecutorError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Durable store for execution state.
#[async_trait]
pub trait ExecutorLoader: Send + Sync {
    async fn fetch_executable_flow(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutableGraph>, ExecutorError>;

    /// Replace the stored graph with this snapshot.
    async fn update_executable_flow(&self, graph: &ExecutableGraph) -> Result<(), ExecutorError>;

    /// Append a finished attempt's log.
    async fn upload_log_file(
        &self,
        execution_id: ExecutionId,
        nested_id: &str,
        attempt: u32,
        path: &Path,
    ) -> Result<(), ExecutorError>;

    /// Atomically claim an execution for `executor_id`. Returns `false` when
    /// another executor already owns it.
    async fn claim_execution(
        &self,
        execution_id: ExecutionId,
        executor_id: &str,
    ) -> Result<bool, ExecutorError>;
}

/// Source of installed project artifacts.
#[async_trait]
pub trait ProjectLoader: Send + Sync {
    /// Local, readable directory holding the files of `(project_id, version)`.
    async fn fetch_project_dir(&self, project_id: u32, version: u32) -> Result<PathBuf, ExecutorError>;
}

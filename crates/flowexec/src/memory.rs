//! Loaders that keep everything in this process
//!
//! Used by the command line runner and by tests.

use async_trait::async_trait;
use flowcore::{ExecutableGraph, ExecutionId, ExecutorError, ExecutorLoader, ProjectLoader};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// A log uploaded by a finished job attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedLog {
    pub execution_id: ExecutionId,
    pub nested_id: String,
    pub attempt: u32,
    pub path: PathBuf,
    pub contents: String,
}

#[derive(Default)]
pub struct InMemoryExecutorLoader {
    flows: RwLock<HashMap<ExecutionId, ExecutableGraph>>,
    claims: RwLock<HashMap<ExecutionId, String>>,
    logs: RwLock<Vec<UploadedLog>>,
    updates: RwLock<usize>,
}

impl InMemoryExecutorLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new execution.
    pub async fn insert(&self, graph: ExecutableGraph) {
        self.flows.write().await.insert(graph.execution_id, graph);
    }

    pub async fn get(&self, execution_id: ExecutionId) -> Option<ExecutableGraph> {
        self.flows.read().await.get(&execution_id).cloned()
    }

    pub async fn claimed_by(&self, execution_id: ExecutionId) -> Option<String> {
        self.claims.read().await.get(&execution_id).cloned()
    }

    pub async fn uploaded_logs(&self) -> Vec<UploadedLog> {
        self.logs.read().await.clone()
    }

    /// Number of persisted state changes so far.
    pub async fn update_count(&self) -> usize {
        *self.updates.read().await
    }
}

#[async_trait]
impl ExecutorLoader for InMemoryExecutorLoader {
    async fn fetch_executable_flow(&self, execution_id: ExecutionId) -> Result<Option<ExecutableGraph>, ExecutorError> {
        Ok(self.get(execution_id).await)
    }

    async fn update_executable_flow(&self, graph: &ExecutableGraph) -> Result<(), ExecutorError> {
        self.flows.write().await.insert(graph.execution_id, graph.clone());
        *self.updates.write().await += 1;
        Ok(())
    }

    async fn upload_log_file(
        &self,
        execution_id: ExecutionId,
        nested_id: &str,
        attempt: u32,
        path: &Path,
    ) -> Result<(), ExecutorError> {
        let contents = tokio::fs::read_to_string(path).await?;
        self.logs.write().await.push(UploadedLog {
            execution_id,
            nested_id: nested_id.to_string(),
            attempt,
            path: path.to_path_buf(),
            contents,
        });
        Ok(())
    }

    async fn claim_execution(&self, execution_id: ExecutionId, executor_id: &str) -> Result<bool, ExecutorError> {
        let mut claims = self.claims.write().await;
        match claims.get(&execution_id) {
            Some(owner) => Ok(owner == executor_id),
            None => {
                claims.insert(execution_id, executor_id.to_string());
                Ok(true)
            }
        }
    }
}

enum Layout {
    Single(PathBuf),
    Versioned(PathBuf),
}

/// Serves project files from the local file system.
pub struct LocalProjectLoader {
    layout: Layout,
}

impl LocalProjectLoader {
    /// Every project and version maps to `dir`.
    pub fn single(dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::Single(dir.into()),
        }
    }

    /// Projects live under `<root>/<project id>/<version>`.
    pub fn versioned(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::Versioned(root.into()),
        }
    }
}

#[async_trait]
impl ProjectLoader for LocalProjectLoader {
    async fn fetch_project_dir(&self, project_id: u32, version: u32) -> Result<PathBuf, ExecutorError> {
        let dir = match &self.layout {
            Layout::Single(dir) => dir.clone(),
            Layout::Versioned(root) => root.join(project_id.to_string()).join(version.to_string()),
        };
        if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(ExecutorError::Project(format!(
                "project {} version {} not found at {}",
                project_id,
                version,
                dir.display()
            )));
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claims_are_exclusive() {
        let loader = InMemoryExecutorLoader::new();
        assert!(loader.claim_execution(1, "a").await.unwrap());
        assert!(loader.claim_execution(1, "a").await.unwrap());
        assert!(!loader.claim_execution(1, "b").await.unwrap());
        assert_eq!(loader.claimed_by(1).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn versioned_projects_resolve_by_id_and_version() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("3/2")).unwrap();
        let projects = LocalProjectLoader::versioned(root.path());

        assert_eq!(projects.fetch_project_dir(3, 2).await.unwrap(), root.path().join("3/2"));
        assert!(matches!(
            projects.fetch_project_dir(3, 1).await,
            Err(ExecutorError::Project(_))
        ));
    }
}

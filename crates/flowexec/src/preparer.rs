use flowcore::{ExecutableGraph, ExecutorError, ProjectLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sets up the working directory of an execution before it runs.
///
/// Each execution gets `<execution_dir>/<execution id>`, filled with a copy
/// of the project's files when a [`ProjectLoader`] is configured.
#[derive(Clone)]
pub struct FlowPreparer {
    execution_dir: PathBuf,
    projects: Option<Arc<dyn ProjectLoader>>,
}

impl FlowPreparer {
    pub fn new(execution_dir: impl Into<PathBuf>) -> Self {
        Self {
            execution_dir: execution_dir.into(),
            projects: None,
        }
    }

    pub fn with_project_loader(mut self, projects: Arc<dyn ProjectLoader>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn execution_dir(&self) -> &Path {
        &self.execution_dir
    }

    pub async fn prepare(&self, graph: &ExecutableGraph) -> Result<PathBuf, ExecutorError> {
        let dir = self.execution_dir.join(graph.execution_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        if let Some(projects) = &self.projects {
            let source = projects.fetch_project_dir(graph.project_id, graph.version).await?;
            tracing::info!(
                "Copying project {} version {} from {} into {}",
                graph.project_id,
                graph.version,
                source.display(),
                dir.display()
            );
            let target = dir.clone();
            tokio::task::spawn_blocking(move || copy_dir(&source, &target))
                .await
                .map_err(|e| ExecutorError::Project(format!("project copy task failed: {}", e)))??;
        }
        Ok(dir)
    }
}

fn copy_dir(source: &Path, target: &Path) -> Result<(), ExecutorError> {
    if !source.is_dir() {
        return Err(ExecutorError::Project(format!(
            "project directory {} does not exist",
            source.display()
        )));
    }
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&path, &destination)?;
        } else {
            std::fs::copy(&path, &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalProjectLoader;
    use flowcore::{FlowDefinition, NodeDefinition};

    #[tokio::test]
    async fn copies_the_project_into_the_execution_dir() {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(project.path().join("scripts")).unwrap();
        std::fs::write(project.path().join("scripts/run.sh"), "echo hi").unwrap();
        let executions = tempfile::tempdir().unwrap();

        let preparer = FlowPreparer::new(executions.path())
            .with_project_loader(Arc::new(LocalProjectLoader::single(project.path())));
        let def = FlowDefinition::new("f").with_node(NodeDefinition::job("a", "noop"));
        let graph = ExecutableGraph::from_definition(5, &def).unwrap();

        let dir = preparer.prepare(&graph).await.unwrap();
        assert_eq!(dir, executions.path().join("5"));
        assert_eq!(std::fs::read_to_string(dir.join("scripts/run.sh")).unwrap(), "echo hi");
    }
}

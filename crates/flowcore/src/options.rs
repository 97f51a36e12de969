use crate::ExecutionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do with the rest of the flow once a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAction {
    /// Let running jobs finish, start nothing new.
    #[default]
    FinishCurrentlyRunning,
    /// Kill everything as soon as a job fails.
    CancelAll,
    /// Keep running every branch that does not depend on the failure.
    FinishAllPossible,
}

/// How far a pipelined execution may run ahead of the execution it watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PipelineLevel {
    /// Wait until the same node in the watched execution has started.
    Started,
    /// Wait until the same node in the watched execution has finished.
    Finished,
}

impl TryFrom<u8> for PipelineLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PipelineLevel::Started),
            2 => Ok(PipelineLevel::Finished),
            other => Err(format!("unsupported pipeline level {}", other)),
        }
    }
}

impl From<PipelineLevel> for u8 {
    fn from(level: PipelineLevel) -> Self {
        match level {
            PipelineLevel::Started => 1,
            PipelineLevel::Finished => 2,
        }
    }
}

/// Options chosen at submission time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub failure_action: FailureAction,
    pub pipeline_execution_id: Option<ExecutionId>,
    pub pipeline_level: Option<PipelineLevel>,
    /// Highest precedence layer of the root flow's input properties.
    pub flow_parameters: BTreeMap<String, String>,
    /// Nested ids of jobs to mark DISABLED before the run.
    pub disabled_jobs: Vec<String>,
}

impl ExecutionOptions {
    pub fn with_failure_action(mut self, action: FailureAction) -> Self {
        self.failure_action = action;
        self
    }

    pub fn with_pipeline(mut self, execution_id: ExecutionId, level: PipelineLevel) -> Self {
        self.pipeline_execution_id = Some(execution_id);
        self.pipeline_level = Some(level);
        self
    }

    pub fn with_flow_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.flow_parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_disabled_job(mut self, nested_id: impl Into<String>) -> Self {
        self.disabled_jobs.push(nested_id.into());
        self
    }

    /// Pipelining applies only when both the target and the level are set.
    pub fn pipeline(&self) -> Option<(ExecutionId, PipelineLevel)> {
        self.pipeline_execution_id.zip(self.pipeline_level)
    }
}

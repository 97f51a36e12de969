//! Flow execution engine
//!
//! Runs [`ExecutableGraph`](flowcore::ExecutableGraph)s: a [`FlowRunner`]
//! drives one execution through its DAG, a [`JobRunner`] runs one attempt of
//! one job, a [`FlowWatcher`] lets an execution trail another one, and the
//! [`FlowRunnerManager`] admits executions onto a bounded number of slots.

mod config;
mod flow_runner;
mod handle;
mod job_runner;
mod manager;
mod memory;
mod preparer;
pub mod properties;
mod registry;
mod watcher;

pub use config::ExecutorConfig;
pub use flow_runner::FlowRunner;
pub use handle::{ControlRequest, FlowRunnerHandle};
pub use job_runner::{log_file_name, JobOutcome, JobRunner, JobSpec, JobUpdate};
pub use manager::FlowRunnerManager;
pub use memory::{InMemoryExecutorLoader, LocalProjectLoader, UploadedLog};
pub use preparer::FlowPreparer;
pub use registry::{JobTypeFactory, JobTypeManager, JobTypeMetadata, JobTypeRegistry, PropertyDefinition};
pub use watcher::FlowWatcher;

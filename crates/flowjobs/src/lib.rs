//! Built-in job types
//!
//! Collection of job types every executor ships with

mod command;
mod debug;
mod time;

pub use command::{CommandJob, CommandJobFactory, JOB_OUTPUT_PROP_FILE};
pub use debug::{EchoJob, EchoJobFactory, FailJob, FailJobFactory, NoopJob, NoopJobFactory};
pub use time::{SleepJob, SleepJobFactory};
use flowexec::JobTypeRegistry;

use std::sync::Arc;

/// Register all built-in job types with a registry
pub fn register_all(registry: &mut JobTypeRegistry) {
    registry.register(Arc::new(debug::NoopJobFactory));
    registry.register(Arc::new(debug::EchoJobFactory));
    registry.register(Arc::new(debug::FailJobFactory));
    registry.register(Arc::new(time::SleepJobFactory));
    registry.register(Arc::new(command::CommandJobFactory));
}

/// Registry holding every built-in job type
pub fn default_registry() -> JobTypeRegistry {
    let mut registry = JobTypeRegistry::new();
    register_all(&mut registry);
    registry
}

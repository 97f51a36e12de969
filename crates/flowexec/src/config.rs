use flowcore::ExecutorError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for an executor worker
///
/// Loadable from JSON; missing fields take their defaults.
///
/// ```ignore
/// let config = ExecutorConfig::default()
///     .with_max_concurrent_flows(4)
///     .with_num_job_threads_per_flow(2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Identity used when claiming executions.
    pub executor_id: String,

    /// Root directory for per-execution working directories.
    pub execution_dir: PathBuf,

    /// Flows allowed to run at the same time.
    pub max_concurrent_flows: usize,

    /// Flows admitted while all slots are busy. Submissions beyond this fail.
    pub flow_queue_capacity: usize,

    /// Default job concurrency inside one flow.
    pub num_job_threads_per_flow: usize,

    /// Safety poll of the flow control loop.
    pub check_interval_ms: u64,

    pub recently_finished_ttl_ms: u64,

    pub cleaner_interval_ms: u64,

    /// Flows running longer than this are killed by the cleaner.
    pub max_flow_running_minutes: Option<u64>,

    pub flow_kill_interval_ms: u64,

    /// Finished execution directories older than this are deleted.
    pub execution_dir_retention_ms: u64,

    pub remote_watch_interval_ms: u64,

    /// Reject jobs whose `user.to.proxy` is not one of the flow's proxy users.
    pub validate_proxy_user: bool,

    pub event_buffer_size: usize,

    /// Base URL used for the execution link property.
    pub web_url: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_id: "local".to_string(),
            execution_dir: PathBuf::from("executions"),
            max_concurrent_flows: 30,
            flow_queue_capacity: 10,
            num_job_threads_per_flow: 10,
            check_interval_ms: 5 * 60 * 1000,
            recently_finished_ttl_ms: 60 * 1000,
            cleaner_interval_ms: 2 * 60 * 1000,
            max_flow_running_minutes: None,
            flow_kill_interval_ms: 5 * 60 * 1000,
            execution_dir_retention_ms: 24 * 60 * 60 * 1000,
            remote_watch_interval_ms: 60 * 1000,
            validate_proxy_user: false,
            event_buffer_size: 1000,
            web_url: None,
        }
    }
}

impl ExecutorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ExecutorError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn with_executor_id(mut self, id: impl Into<String>) -> Self {
        self.executor_id = id.into();
        self
    }

    pub fn with_execution_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.execution_dir = dir.into();
        self
    }

    pub fn with_max_concurrent_flows(mut self, n: usize) -> Self {
        self.max_concurrent_flows = n;
        self
    }

    pub fn with_flow_queue_capacity(mut self, n: usize) -> Self {
        self.flow_queue_capacity = n;
        self
    }

    pub fn with_num_job_threads_per_flow(mut self, n: usize) -> Self {
        self.num_job_threads_per_flow = n;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_recently_finished_ttl(mut self, ttl: Duration) -> Self {
        self.recently_finished_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_cleaner_interval(mut self, interval: Duration) -> Self {
        self.cleaner_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_flow_running_minutes(mut self, minutes: u64) -> Self {
        self.max_flow_running_minutes = Some(minutes);
        self
    }

    pub fn with_remote_watch_interval(mut self, interval: Duration) -> Self {
        self.remote_watch_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_validate_proxy_user(mut self, validate: bool) -> Self {
        self.validate_proxy_user = validate;
        self
    }

    pub fn with_web_url(mut self, url: impl Into<String>) -> Self {
        self.web_url = Some(url.into());
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn recently_finished_ttl(&self) -> Duration {
        Duration::from_millis(self.recently_finished_ttl_ms)
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.cleaner_interval_ms.max(1))
    }

    pub fn flow_kill_interval(&self) -> Duration {
        Duration::from_millis(self.flow_kill_interval_ms.max(1))
    }

    pub fn execution_dir_retention(&self) -> Duration {
        Duration::from_millis(self.execution_dir_retention_ms)
    }

    pub fn remote_watch_interval(&self) -> Duration {
        Duration::from_millis(self.remote_watch_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"max_concurrent_flows": 2, "validate_proxy_user": true}"#).unwrap();
        assert_eq!(config.max_concurrent_flows, 2);
        assert!(config.validate_proxy_user);
        assert_eq!(config.num_job_threads_per_flow, 10);
        assert_eq!(config.check_interval(), Duration::from_secs(300));
        assert_eq!(config.recently_finished_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn builders_override() {
        let config = ExecutorConfig::default()
            .with_check_interval(Duration::from_millis(50))
            .with_num_job_threads_per_flow(3);
        assert_eq!(config.check_interval_ms, 50);
        assert_eq!(config.num_job_threads_per_flow, 3);
    }
}

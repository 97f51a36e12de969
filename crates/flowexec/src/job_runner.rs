use crate::properties::{JOB_ATTEMPT, JOB_EXEC_ID, JOB_ID, JOB_NESTED_PATH, USER_TO_PROXY, WORKING_DIR};
use crate::registry::JobTypeManager;
use chrono::{DateTime, Utc};
use flowcore::{ExecutionId, ExecutorLoader, Job, JobContext, JobError, JobLog, NodeId, Props, Status};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// What to run for one attempt of a job node.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub node: NodeId,
    pub nested_id: String,
    pub job_type: String,
    pub attempt: u32,
    /// Resolved input properties.
    pub props: Props,
    /// Start delay, used for retry backoff.
    pub delay: Duration,
}

/// Final result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub node: NodeId,
    pub attempt: u32,
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub output_props: Option<Props>,
    pub failure_message: Option<String>,
}

/// Progress reported back to the owning flow.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Started {
        node: NodeId,
        attempt: u32,
        time: DateTime<Utc>,
    },
    Finished(JobOutcome),
}

/// Runs exactly one attempt of one job node.
///
/// The runner never touches the graph: it reports [`JobUpdate`]s and the flow
/// applies them.
pub struct JobRunner {
    execution_id: ExecutionId,
    spec: JobSpec,
    job_types: Arc<dyn JobTypeManager>,
    updates: mpsc::UnboundedSender<JobUpdate>,
    loader: Option<Arc<dyn ExecutorLoader>>,
    execution_dir: PathBuf,
    permits: Option<Arc<Semaphore>>,
    cancellation: CancellationToken,
    submit_user: String,
    proxy_users: Option<BTreeSet<String>>,
}

impl JobRunner {
    pub fn new(
        execution_id: ExecutionId,
        spec: JobSpec,
        job_types: Arc<dyn JobTypeManager>,
        updates: mpsc::UnboundedSender<JobUpdate>,
    ) -> Self {
        Self {
            execution_id,
            spec,
            job_types,
            updates,
            loader: None,
            execution_dir: PathBuf::from("."),
            permits: None,
            cancellation: CancellationToken::new(),
            submit_user: String::new(),
            proxy_users: None,
        }
    }

    /// Upload the attempt log here once the attempt ends.
    pub fn with_loader(mut self, loader: Arc<dyn ExecutorLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_execution_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.execution_dir = dir.into();
        self
    }

    /// Per-flow job slots; the runner waits for one before starting.
    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = Some(permits);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_submit_user(mut self, user: impl Into<String>) -> Self {
        self.submit_user = user.into();
        self
    }

    /// Only these users may be proxied through `user.to.proxy`.
    pub fn with_proxy_validation(mut self, allowed: BTreeSet<String>) -> Self {
        self.proxy_users = Some(allowed);
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Run the attempt and report its outcome. Returns the outcome as well.
    pub async fn run(self) -> JobOutcome {
        let outcome = self.execute().await;
        tracing::info!(
            "Job {} of execution {} attempt {} finished with {}",
            self.spec.nested_id,
            self.execution_id,
            self.spec.attempt,
            outcome.status
        );
        let _ = self.updates.send(JobUpdate::Finished(outcome.clone()));
        outcome
    }

    async fn execute(&self) -> JobOutcome {
        if self.cancellation.is_cancelled() {
            return self.short_circuit(Status::Killed, "killed before start");
        }

        if !self.spec.delay.is_zero() {
            tracing::debug!("Delaying job {} for {:?}", self.spec.nested_id, self.spec.delay);
            tokio::select! {
                _ = tokio::time::sleep(self.spec.delay) => {}
                _ = self.cancellation.cancelled() => {
                    return self.short_circuit(Status::Killed, "killed while waiting for retry backoff");
                }
            }
        }

        let _permit: Option<OwnedSemaphorePermit> = match &self.permits {
            Some(permits) => tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return self.short_circuit(Status::Killed, "job slots closed"),
                },
                _ = self.cancellation.cancelled() => {
                    return self.short_circuit(Status::Killed, "killed while queued");
                }
            },
            None => None,
        };

        let start_time = Utc::now();
        let _ = self.updates.send(JobUpdate::Started {
            node: self.spec.node,
            attempt: self.spec.attempt,
            time: start_time,
        });
        tracing::info!(
            "Starting job {} of execution {} (attempt {})",
            self.spec.nested_id,
            self.execution_id,
            self.spec.attempt
        );

        let log = self.open_log();
        log.info(format!(
            "Starting job {} attempt {} of execution {}",
            self.spec.nested_id, self.spec.attempt, self.execution_id
        ));

        let result = match self.prepare(&log) {
            Ok(ctx) => self.run_job(ctx).await,
            Err(e) => Err(e),
        };

        let killed = self.cancellation.is_cancelled();
        let (status, output_props, failure_message) = match result {
            _ if killed => (Status::Killed, None, Some("job was killed".to_string())),
            Ok(outputs) => (Status::Succeeded, Some(outputs), None),
            Err(e) => {
                log.error(format!("Job failed: {}", e));
                (Status::Failed, None, Some(e.to_string()))
            }
        };
        log.info(format!("Finished job {} with status {}", self.spec.nested_id, status));
        log.close().await;
        self.upload_log(&log).await;

        JobOutcome {
            node: self.spec.node,
            attempt: self.spec.attempt,
            status,
            start_time: Some(start_time),
            end_time: Utc::now(),
            output_props,
            failure_message,
        }
    }

    fn prepare(&self, log: &JobLog) -> Result<JobContext, JobError> {
        let mut props = self.spec.props.clone();
        props.put(JOB_ID, self.spec.nested_id.rsplit(':').next().unwrap_or(&self.spec.nested_id));
        props.put(JOB_NESTED_PATH, self.spec.nested_id.clone());
        props.put(JOB_ATTEMPT, self.spec.attempt.to_string());
        props.put(JOB_EXEC_ID, self.execution_id.to_string());
        props.put_if_absent(USER_TO_PROXY, self.submit_user.clone());

        if let Some(allowed) = &self.proxy_users {
            let user = props.get_or(USER_TO_PROXY, "");
            if user != self.submit_user && !allowed.contains(user) {
                return Err(JobError::ProxyUser { user: user.to_string() });
            }
        }

        let working_dir = resolve_working_dir(&self.execution_dir, props.get(WORKING_DIR))?;
        props.put(WORKING_DIR, working_dir.display().to_string());

        Ok(JobContext {
            execution_id: self.execution_id,
            job_id: self.spec.nested_id.clone(),
            attempt: self.spec.attempt,
            props,
            working_dir,
            log: log.clone(),
            cancellation: self.cancellation.clone(),
        })
    }

    async fn run_job(&self, ctx: JobContext) -> Result<Props, JobError> {
        let job: Box<dyn Job> = self
            .job_types
            .create_job(&self.spec.job_type, &self.spec.nested_id, &ctx.props)?;

        let run = job.run(ctx);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = self.cancellation.cancelled() => {}
        }

        tracing::info!("Cancelling job {} of execution {}", self.spec.nested_id, self.execution_id);
        if let Err(e) = job.cancel().await {
            tracing::warn!("Cancel hook of {} failed: {}", self.spec.nested_id, e);
        }
        // the job decides when it stops
        run.await
    }

    fn short_circuit(&self, status: Status, reason: &str) -> JobOutcome {
        tracing::info!("Job {} {}", self.spec.nested_id, reason);
        JobOutcome {
            node: self.spec.node,
            attempt: self.spec.attempt,
            status,
            start_time: None,
            end_time: Utc::now(),
            output_props: None,
            failure_message: Some(reason.to_string()),
        }
    }

    fn open_log(&self) -> JobLog {
        let path = self.execution_dir.join(log_file_name(
            self.execution_id,
            &self.spec.nested_id,
            self.spec.attempt,
        ));
        match JobLog::create(self.spec.nested_id.clone(), &path) {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!("Cannot create log file {}: {}", path.display(), e);
                JobLog::discard(self.spec.nested_id.clone())
            }
        }
    }

    async fn upload_log(&self, log: &JobLog) {
        let (Some(loader), Some(path)) = (&self.loader, log.path()) else {
            return;
        };
        if let Err(e) = loader
            .upload_log_file(self.execution_id, &self.spec.nested_id, self.spec.attempt, path)
            .await
        {
            tracing::error!("Failed to upload log of job {}: {}", self.spec.nested_id, e);
        }
    }
}

/// `_job.<exec>.<nested>.log`, with `.<attempt>` before the extension for retries.
pub fn log_file_name(execution_id: ExecutionId, nested_id: &str, attempt: u32) -> String {
    if attempt > 0 {
        format!("_job.{}.{}.{}.log", execution_id, nested_id, attempt)
    } else {
        format!("_job.{}.{}.log", execution_id, nested_id)
    }
}

/// Jobs run inside the execution directory; an explicit `working.dir` must stay there.
fn resolve_working_dir(execution_dir: &Path, requested: Option<&str>) -> Result<PathBuf, JobError> {
    let Some(requested) = requested.filter(|r| !r.trim().is_empty()) else {
        return Ok(execution_dir.to_path_buf());
    };
    let requested = Path::new(requested.trim());
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        execution_dir.join(requested)
    };

    let escapes = candidate.components().any(|c| matches!(c, Component::ParentDir));
    if escapes || !candidate.starts_with(execution_dir) {
        return Err(JobError::Configuration(format!(
            "working directory {} is outside the execution directory {}",
            candidate.display(),
            execution_dir.display()
        )));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_names_carry_the_attempt_after_the_first() {
        assert_eq!(log_file_name(7, "sub:a", 0), "_job.7.sub:a.log");
        assert_eq!(log_file_name(7, "a", 2), "_job.7.a.2.log");
    }

    #[test]
    fn working_dir_must_stay_inside_execution_dir() {
        let exec = Path::new("/data/executions/12");
        assert_eq!(resolve_working_dir(exec, None).unwrap(), exec);
        assert_eq!(resolve_working_dir(exec, Some("  ")).unwrap(), exec);
        assert_eq!(resolve_working_dir(exec, Some("scripts")).unwrap(), exec.join("scripts"));
        assert_eq!(
            resolve_working_dir(exec, Some("/data/executions/12/lib")).unwrap(),
            exec.join("lib")
        );
        assert!(resolve_working_dir(exec, Some("/tmp")).is_err());
        assert!(resolve_working_dir(exec, Some("../11")).is_err());
    }
}

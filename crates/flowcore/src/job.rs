use crate::{ExecutionId, JobError, Props};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A runnable job produced by a job type for one attempt
#[async_trait]
pub trait Job: Send + Sync {
    /// Job type identifier (e.g., "command", "noop")
    fn job_type(&self) -> &str;

    /// Run to completion and return the generated output properties.
    async fn run(&self, ctx: JobContext) -> Result<Props, JobError>;

    /// Advisory stop request. The attempt still ends when `run` returns.
    async fn cancel(&self) -> Result<(), JobError> {
        Ok(())
    }
}

/// Everything a job needs for one attempt
#[derive(Clone)]
pub struct JobContext {
    pub execution_id: ExecutionId,

    /// Nested id of the job, e.g. `sub:job`
    pub job_id: String,

    pub attempt: u32,

    /// Fully resolved properties
    pub props: Props,

    pub working_dir: PathBuf,

    pub log: JobLog,

    /// Cancelled when the job is killed
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn require_prop(&self, name: &str) -> Result<&str, JobError> {
        self.props
            .get(name)
            .ok_or_else(|| JobError::MissingProperty(name.to_string()))
    }

    pub fn prop_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.props.get_or(name, default)
    }
}

/// Lines are kept in memory until this many bytes are pending.
const LOG_BUFFER_SIZE: usize = 64 * 1024;

/// Per-attempt job log.
///
/// Cloning shares the underlying file. Lines are buffered, so writing from an
/// async task only touches the disk when the buffer fills; [`JobLog::close`]
/// flushes the rest off the runtime. A log created with [`JobLog::discard`]
/// only forwards to tracing.
#[derive(Clone)]
pub struct JobLog {
    job_id: String,
    path: Option<PathBuf>,
    file: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl JobLog {
    pub fn create(job_id: impl Into<String>, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            job_id: job_id.into(),
            path: Some(path),
            file: Arc::new(Mutex::new(Some(BufWriter::with_capacity(LOG_BUFFER_SIZE, file)))),
        })
    }

    pub fn discard(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            path: None,
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        tracing::debug!("[{}] {}", self.job_id, message.as_ref());
        self.write("INFO", message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        tracing::debug!("[{}] {}", self.job_id, message.as_ref());
        self.write("WARN", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        tracing::debug!("[{}] {}", self.job_id, message.as_ref());
        self.write("ERROR", message.as_ref());
    }

    fn write(&self, level: &str, message: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if let Some(file) = guard.as_mut() {
            let line = format!("{} {} {}\n", Utc::now().to_rfc3339(), level, message);
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!("Failed to write job log for {}: {}", self.job_id, e);
            }
        }
    }

    /// Flush and close the file; later writes only reach tracing.
    pub async fn close(&self) {
        let writer = match self.file.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(mut writer) = writer else {
            return;
        };
        let flushed = tokio::task::spawn_blocking(move || writer.flush()).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to flush job log for {}: {}", self.job_id, e),
            Err(e) => tracing::warn!("Job log flush for {} did not complete: {}", self.job_id, e),
        }
    }
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog")
            .field("job_id", &self.job_id)
            .field("path", &self.path)
            .finish()
    }
}

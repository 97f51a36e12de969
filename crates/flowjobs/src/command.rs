use async_trait::async_trait;
use flowcore::{Job, JobContext, JobError, JobLog, Props};
use flowexec::{JobTypeFactory, JobTypeMetadata, PropertyDefinition};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Environment variable naming the file a command may write its output
/// properties to, as a flat JSON object.
pub const JOB_OUTPUT_PROP_FILE: &str = "JOB_OUTPUT_PROP_FILE";

/// Runs `command`, then `command.1`, `command.2`, ... through `sh -c` in the
/// job's working directory. `env.*` properties become environment variables.
pub struct CommandJob {
    commands: Vec<String>,
}

impl CommandJob {
    pub fn from_props(props: &Props) -> Result<Self, JobError> {
        let first = props
            .get("command")
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| JobError::MissingProperty("command".to_string()))?;

        let mut commands = vec![first.to_string()];
        let mut n = 1;
        while let Some(next) = props.get(&format!("command.{}", n)) {
            commands.push(next.to_string());
            n += 1;
        }
        Ok(Self { commands })
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    async fn run_command(&self, ctx: &JobContext, command: &str, output_file: &Path) -> Result<(), JobError> {
        ctx.log.info(format!("Command: {}", command));

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&ctx.working_dir)
            .env(JOB_OUTPUT_PROP_FILE, output_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in ctx.props.with_prefix("env.").iter() {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| JobError::ExecutionFailed(format!("Failed to spawn `{}`: {}", command, e)))?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(pipe_to_log(out, ctx.log.clone(), false)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(pipe_to_log(err, ctx.log.clone(), true)));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = ctx.cancellation.cancelled() => {
                ctx.log.warn(format!("Killing process {:?}", child.id()));
                if let Err(e) = child.start_kill() {
                    ctx.log.warn(format!("Failed to kill process: {}", e));
                }
                child.wait().await
            }
        }
        .map_err(|e| JobError::ExecutionFailed(format!("Failed to wait for process: {}", e)))?;

        for pipe in [stdout, stderr].into_iter().flatten() {
            let _ = pipe.await;
        }

        if ctx.cancellation.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if !status.success() {
            return Err(JobError::ExecutionFailed(format!(
                "Command `{}` exited with {}",
                command, status
            )));
        }
        Ok(())
    }
}

async fn pipe_to_log<R: AsyncRead + Unpin>(stream: R, log: JobLog, is_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            log.warn(line);
        } else {
            log.info(line);
        }
    }
}

fn output_file_path(ctx: &JobContext) -> PathBuf {
    let name = ctx.job_id.replace(flowcore::NESTED_ID_SEPARATOR, "_");
    ctx.working_dir
        .join(format!("_output.{}.{}.{}.json", ctx.execution_id, name, ctx.attempt))
}

/// Flat JSON object to properties. Non-string values keep their JSON text.
fn read_output_props(path: &Path) -> Result<Props, JobError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Props::new()),
        Err(e) => return Err(JobError::ExecutionFailed(format!("Cannot read output properties: {}", e))),
    };
    if raw.trim().is_empty() {
        return Ok(Props::new());
    }
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| JobError::ExecutionFailed(format!("Output properties are not valid JSON: {}", e)))?;
    let serde_json::Value::Object(map) = value else {
        return Err(JobError::ExecutionFailed(
            "Output properties must be a JSON object".to_string(),
        ));
    };
    Ok(map
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => (key, s),
            other => (key, other.to_string()),
        })
        .collect())
}

#[async_trait]
impl Job for CommandJob {
    fn job_type(&self) -> &str {
        "command"
    }

    async fn run(&self, ctx: JobContext) -> Result<Props, JobError> {
        let output_file = output_file_path(&ctx);
        for command in &self.commands {
            self.run_command(&ctx, command, &output_file).await?;
        }
        let outputs = read_output_props(&output_file)?;
        if !outputs.is_empty() {
            ctx.log.info(format!("Generated {} output properties", outputs.len()));
        }
        let _ = std::fs::remove_file(&output_file);
        Ok(outputs)
    }
}

pub struct CommandJobFactory;

impl JobTypeFactory for CommandJobFactory {
    fn create(&self, _job_id: &str, props: &Props) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(CommandJob::from_props(props)?))
    }

    fn job_type(&self) -> &str {
        "command"
    }

    fn metadata(&self) -> JobTypeMetadata {
        JobTypeMetadata {
            description: "Run shell commands in the working directory".to_string(),
            category: "process".to_string(),
            properties: vec![
                PropertyDefinition {
                    name: "command".to_string(),
                    description: "First command to run".to_string(),
                    required: true,
                },
                PropertyDefinition {
                    name: "command.N".to_string(),
                    description: "Further commands, run in order".to_string(),
                    required: false,
                },
            ],
        }
    }
}

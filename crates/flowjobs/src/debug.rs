use async_trait::async_trait;
use flowcore::{Job, JobContext, JobError, Props};
use flowexec::{JobTypeFactory, JobTypeMetadata, PropertyDefinition};

/// Does nothing and succeeds
pub struct NoopJob;

#[async_trait]
impl Job for NoopJob {
    fn job_type(&self) -> &str {
        "noop"
    }

    async fn run(&self, ctx: JobContext) -> Result<Props, JobError> {
        ctx.log.info("noop");
        Ok(Props::new())
    }
}

pub struct NoopJobFactory;

impl JobTypeFactory for NoopJobFactory {
    fn create(&self, _job_id: &str, _props: &Props) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(NoopJob))
    }

    fn job_type(&self) -> &str {
        "noop"
    }

    fn metadata(&self) -> JobTypeMetadata {
        JobTypeMetadata {
            description: "Succeeds without doing anything".to_string(),
            category: "debug".to_string(),
            properties: vec![],
        }
    }
}

/// Logs a message and emits every `output.*` property with the prefix removed
pub struct EchoJob;

#[async_trait]
impl Job for EchoJob {
    fn job_type(&self) -> &str {
        "echo"
    }

    async fn run(&self, ctx: JobContext) -> Result<Props, JobError> {
        let message = ctx.prop_or("message", "(no message)");
        ctx.log.info(format!("ECHO: {}", message));

        let outputs = ctx.props.with_prefix("output.");
        for (key, value) in outputs.iter() {
            ctx.log.info(format!("  {} = {}", key, value));
        }
        Ok(outputs)
    }
}

pub struct EchoJobFactory;

impl JobTypeFactory for EchoJobFactory {
    fn create(&self, _job_id: &str, _props: &Props) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(EchoJob))
    }

    fn job_type(&self) -> &str {
        "echo"
    }

    fn metadata(&self) -> JobTypeMetadata {
        JobTypeMetadata {
            description: "Logs a message and outputs its output.* properties".to_string(),
            category: "debug".to_string(),
            properties: vec![PropertyDefinition {
                name: "message".to_string(),
                description: "Text written to the job log".to_string(),
                required: false,
            }],
        }
    }
}

/// Always fails, with `fail.message` as the reason
pub struct FailJob;

#[async_trait]
impl Job for FailJob {
    fn job_type(&self) -> &str {
        "fail"
    }

    async fn run(&self, ctx: JobContext) -> Result<Props, JobError> {
        let message = ctx.prop_or("fail.message", "failed on purpose");
        ctx.log.error(message);
        Err(JobError::ExecutionFailed(message.to_string()))
    }
}

pub struct FailJobFactory;

impl JobTypeFactory for FailJobFactory {
    fn create(&self, _job_id: &str, _props: &Props) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(FailJob))
    }

    fn job_type(&self) -> &str {
        "fail"
    }

    fn metadata(&self) -> JobTypeMetadata {
        JobTypeMetadata {
            description: "Fails every attempt".to_string(),
            category: "debug".to_string(),
            properties: vec![PropertyDefinition {
                name: "fail.message".to_string(),
                description: "Failure reason".to_string(),
                required: false,
            }],
        }
    }
}

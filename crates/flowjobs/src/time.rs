use async_trait::async_trait;
use flowcore::{Job, JobContext, JobError, Props};
use flowexec::{JobTypeFactory, JobTypeMetadata, PropertyDefinition};
use tokio::time::{sleep, Duration};

/// Sleep for `sleep.ms` milliseconds. A kill ends the sleep early.
pub struct SleepJob;

#[async_trait]
impl Job for SleepJob {
    fn job_type(&self) -> &str {
        "sleep"
    }

    async fn run(&self, ctx: JobContext) -> Result<Props, JobError> {
        let sleep_ms = match ctx.props.get("sleep.ms") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| JobError::Configuration(format!("sleep.ms is not a number: {}", raw)))?,
            None => 1000,
        };

        ctx.log.info(format!("Sleeping for {}ms", sleep_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(sleep_ms)) => Ok(Props::new()),
            _ = ctx.cancellation.cancelled() => {
                ctx.log.warn("Sleep interrupted");
                Err(JobError::Cancelled)
            }
        }
    }
}

pub struct SleepJobFactory;

impl JobTypeFactory for SleepJobFactory {
    fn create(&self, _job_id: &str, _props: &Props) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(SleepJob))
    }

    fn job_type(&self) -> &str {
        "sleep"
    }

    fn metadata(&self) -> JobTypeMetadata {
        JobTypeMetadata {
            description: "Sleep for the given milliseconds".to_string(),
            category: "time".to_string(),
            properties: vec![PropertyDefinition {
                name: "sleep.ms".to_string(),
                description: "Milliseconds to sleep, 1000 by default".to_string(),
                required: false,
            }],
        }
    }
}

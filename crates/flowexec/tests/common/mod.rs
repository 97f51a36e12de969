#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    EventBus, ExecutableGraph, ExecutionId, FlowDefinition, Job, JobContext, JobError, NodeDefinition, Props, Status,
};
use flowexec::{FlowRunner, FlowRunnerHandle, InMemoryExecutorLoader, JobTypeFactory, JobTypeRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const TEST_JOB_TYPE: &str = "test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared state of the `test` job type.
///
/// A job behaves according to its properties:
/// - `test.wait=true` blocks until [`TestJobs::release`] or a kill
/// - `test.sleep.ms` sleeps first
/// - `test.fail=true` fails every attempt, `test.fail.attempts=N` the first N
/// - `test.output.*` become output properties
#[derive(Default)]
pub struct TestJobs {
    runs: Mutex<Vec<(ExecutionId, String, u32)>>,
    props: Mutex<HashMap<String, Props>>,
    gates: Mutex<HashMap<String, watch::Sender<Option<bool>>>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl TestJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registry(self: &Arc<Self>) -> JobTypeRegistry {
        let mut registry = JobTypeRegistry::new();
        registry.register(Arc::new(TestJobFactory { jobs: self.clone() }));
        registry
    }

    fn gate(&self, execution_id: ExecutionId, nested_id: &str) -> watch::Sender<Option<bool>> {
        self.gates
            .lock()
            .unwrap()
            .entry(format!("{}/{}", execution_id, nested_id))
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Let a waiting job of `execution_id` finish.
    pub fn release(&self, execution_id: ExecutionId, nested_id: &str, succeed: bool) {
        self.gate(execution_id, nested_id).send_replace(Some(succeed));
    }

    /// Nested ids of every attempt started, in order.
    pub fn runs(&self, execution_id: ExecutionId) -> Vec<String> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == execution_id)
            .map(|(_, job, _)| job.clone())
            .collect()
    }

    pub fn attempts(&self, execution_id: ExecutionId, nested_id: &str) -> Vec<u32> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, job, _)| *id == execution_id && job == nested_id)
            .map(|(_, _, attempt)| *attempt)
            .collect()
    }

    /// Properties the latest attempt of a job ran with.
    pub fn last_props(&self, execution_id: ExecutionId, nested_id: &str) -> Option<Props> {
        self.props
            .lock()
            .unwrap()
            .get(&format!("{}/{}", execution_id, nested_id))
            .cloned()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct TestJobFactory {
    jobs: Arc<TestJobs>,
}

impl JobTypeFactory for TestJobFactory {
    fn create(&self, _job_id: &str, _props: &Props) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(TestJob { jobs: self.jobs.clone() }))
    }

    fn job_type(&self) -> &str {
        TEST_JOB_TYPE
    }
}

struct TestJob {
    jobs: Arc<TestJobs>,
}

impl TestJob {
    async fn behave(&self, ctx: &JobContext) -> Result<Props, JobError> {
        let mut succeed = true;
        if ctx.props.get_bool("test.wait").unwrap_or(false) {
            let mut gate = self.jobs.gate(ctx.execution_id, &ctx.job_id).subscribe();
            tokio::select! {
                released = gate.wait_for(|v| v.is_some()) => {
                    succeed = released.map(|v| (*v).unwrap_or(true)).unwrap_or(false);
                }
                _ = ctx.cancellation.cancelled() => return Err(JobError::Cancelled),
            }
        }
        if let Some(ms) = ctx.props.get_i64("test.sleep.ms") {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {}
                _ = ctx.cancellation.cancelled() => return Err(JobError::Cancelled),
            }
        }

        let fail_attempts = ctx.props.get_i64("test.fail.attempts").unwrap_or(0);
        if !succeed || ctx.props.get_bool("test.fail").unwrap_or(false) || (ctx.attempt as i64) < fail_attempts {
            return Err(JobError::ExecutionFailed(format!("{} failed on purpose", ctx.job_id)));
        }
        Ok(ctx.props.with_prefix("test.output."))
    }
}

#[async_trait]
impl Job for TestJob {
    fn job_type(&self) -> &str {
        TEST_JOB_TYPE
    }

    async fn run(&self, ctx: JobContext) -> Result<Props, JobError> {
        self.jobs
            .runs
            .lock()
            .unwrap()
            .push((ctx.execution_id, ctx.job_id.clone(), ctx.attempt));
        self.jobs
            .props
            .lock()
            .unwrap()
            .insert(format!("{}/{}", ctx.execution_id, ctx.job_id), ctx.props.clone());
        let now = self.jobs.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.jobs.max_running.fetch_max(now, Ordering::SeqCst);

        let result = self.behave(&ctx).await;

        self.jobs.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn job(id: &str) -> NodeDefinition {
    NodeDefinition::job(id, TEST_JOB_TYPE)
}

pub fn waiting_job(id: &str) -> NodeDefinition {
    job(id).with_prop("test.wait", "true")
}

pub fn failing_job(id: &str) -> NodeDefinition {
    job(id).with_prop("test.fail", "true")
}

pub fn graph(execution_id: ExecutionId, def: &FlowDefinition) -> ExecutableGraph {
    ExecutableGraph::from_definition(execution_id, def)
        .unwrap()
        .with_submit_user("tester")
}

/// Everything a flow needs to run in a test.
pub struct Harness {
    pub jobs: Arc<TestJobs>,
    pub loader: Arc<InMemoryExecutorLoader>,
    pub events: EventBus,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            jobs: TestJobs::new(),
            loader: Arc::new(InMemoryExecutorLoader::new()),
            events: EventBus::new(1000),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn runner(&self, graph: ExecutableGraph) -> FlowRunner {
        FlowRunner::new(
            graph,
            Arc::new(self.jobs.registry()),
            self.loader.clone(),
            self.events.clone(),
        )
        .with_execution_dir(self.dir.path())
        .with_check_interval(Duration::from_millis(50))
    }

    /// Start the runner on its own task.
    pub fn start(&self, runner: FlowRunner) -> (FlowRunnerHandle, tokio::task::JoinHandle<Status>) {
        let handle = runner.handle();
        (handle, tokio::spawn(runner.run()))
    }

    /// Run a flow to completion and return its final state.
    pub async fn run(&self, graph: ExecutableGraph) -> ExecutableGraph {
        let runner = self.runner(graph);
        let handle = runner.handle();
        let status = tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .expect("flow did not finish");
        let graph = handle.snapshot().await;
        assert_eq!(graph.status(), status);
        graph
    }
}

pub fn status(graph: &ExecutableGraph, nested_id: &str) -> Status {
    graph
        .status_of(nested_id)
        .unwrap_or_else(|| panic!("no node {}", nested_id))
}

/// Poll until `nested_id` has `expected`, or fail after a few seconds.
pub async fn wait_for_status(handle: &FlowRunnerHandle, nested_id: &str, expected: Status) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let graph = handle.snapshot().await;
        if graph.status_of(nested_id) == Some(expected) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "{} is {:?}, expected {}",
                nested_id,
                graph.status_of(nested_id),
                expected
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_flow_status(handle: &FlowRunnerHandle, expected: Status) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = handle.status().await;
        if status == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("flow is {}, expected {}", status, expected);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn finish(join: tokio::task::JoinHandle<Status>) -> Status {
    tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .expect("flow did not finish")
        .expect("flow task panicked")
}

//! Control loop of one flow execution
//!
//! The [`FlowRunner`] owns the execution state of a single flow. It is the
//! only task that mutates the [`ExecutableGraph`]: job runners report their
//! progress through a channel, operators go through a [`FlowRunnerHandle`],
//! and a pipelining [`FlowWatcher`] only signals that something changed.
//! Every pass of the loop applies what arrived, then walks the graph from the
//! nodes that finished since the last pass and dispatches whatever became
//! eligible.

use crate::config::ExecutorConfig;
use crate::handle::{ControlRequest, ControlState, FlowRunnerHandle};
use crate::job_runner::{JobOutcome, JobRunner, JobSpec, JobUpdate};
use crate::properties::{common_flow_props, flow_output_props, node_input_props, root_input_props};
use crate::registry::JobTypeManager;
use crate::watcher::FlowWatcher;
use chrono::{DateTime, Utc};
use flowcore::{
    ConditionOnJobStatus, ConditionOutcome, EventBus, ExecutableGraph, ExecutionEvent, ExecutionId, ExecutorLoader,
    FailureAction, NodeId, Status,
};
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

enum Inbox {
    Job(JobUpdate),
    Control(ControlRequest),
}

enum Wake {
    Job(Option<JobUpdate>),
    Control(Option<ControlRequest>),
    Watcher(bool),
    Joined,
    Timeout,
}

/// Executes one flow to completion.
pub struct FlowRunner {
    execution_id: ExecutionId,
    graph: Arc<RwLock<ExecutableGraph>>,
    control: Arc<ControlState>,
    job_types: Arc<dyn JobTypeManager>,
    loader: Arc<dyn ExecutorLoader>,
    events: EventBus,

    execution_dir: PathBuf,
    check_interval: Duration,
    web_url: Option<String>,
    validate_proxy_user: bool,
    permits: Arc<Semaphore>,
    watcher: Option<Arc<FlowWatcher>>,
    watcher_changes: Option<watch::Receiver<u64>>,

    jobs: JoinSet<()>,
    job_tx: mpsc::UnboundedSender<JobUpdate>,
    job_rx: mpsc::UnboundedReceiver<JobUpdate>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    backlog: VecDeque<Inbox>,

    /// Dispatched job nodes and the attempt they run.
    active: HashMap<NodeId, u32>,
    /// Nodes finished since the last pass.
    finished: Vec<NodeId>,
    /// Eligible nodes waiting on the pipelined execution or on resume.
    held_back: BTreeSet<NodeId>,
    flow_finished: bool,
    dirty: bool,
}

impl FlowRunner {
    pub fn new(
        graph: ExecutableGraph,
        job_types: Arc<dyn JobTypeManager>,
        loader: Arc<dyn ExecutorLoader>,
        events: EventBus,
    ) -> Self {
        let defaults = ExecutorConfig::default();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            execution_id: graph.execution_id,
            graph: Arc::new(RwLock::new(graph)),
            control: Arc::new(ControlState::default()),
            job_types,
            loader,
            events,
            execution_dir: PathBuf::from("."),
            check_interval: defaults.check_interval(),
            web_url: None,
            validate_proxy_user: false,
            permits: Arc::new(Semaphore::new(defaults.num_job_threads_per_flow.max(1))),
            watcher: None,
            watcher_changes: None,
            jobs: JoinSet::new(),
            job_tx,
            job_rx,
            control_tx,
            control_rx,
            backlog: VecDeque::new(),
            active: HashMap::new(),
            finished: Vec::new(),
            held_back: BTreeSet::new(),
            flow_finished: false,
            dirty: false,
        }
    }

    /// Take the loop interval, job concurrency and job settings from `config`.
    pub fn with_config(self, config: &ExecutorConfig) -> Self {
        let mut runner = self
            .with_check_interval(config.check_interval())
            .with_num_job_threads(config.num_job_threads_per_flow);
        runner.web_url = config.web_url.clone();
        runner.validate_proxy_user = config.validate_proxy_user;
        runner
    }

    /// Working directory of this execution. Job logs land here too.
    pub fn with_execution_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.execution_dir = dir.into();
        self
    }

    pub fn with_num_job_threads(mut self, threads: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(threads.max(1)));
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_proxy_validation(mut self, validate: bool) -> Self {
        self.validate_proxy_user = validate;
        self
    }

    /// Gate jobs on another execution according to the pipeline level of
    /// the execution options.
    pub fn with_watcher(mut self, watcher: Arc<FlowWatcher>) -> Self {
        self.watcher_changes = Some(watcher.subscribe());
        self.control.set_watcher(watcher.clone());
        self.watcher = Some(watcher);
        self
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn handle(&self) -> FlowRunnerHandle {
        FlowRunnerHandle::new(
            self.execution_id,
            self.graph.clone(),
            self.control.clone(),
            self.control_tx.clone(),
            self.events.clone(),
        )
    }

    /// Run the flow until its root reaches a terminal status.
    pub async fn run(mut self) -> Status {
        tracing::info!("Starting flow execution {}", self.execution_id);
        let lock = self.graph.clone();
        {
            let mut graph = lock.write().await;
            self.start_flow(&mut graph);
            self.persist(&graph).await;
        }

        loop {
            let mut graph = lock.write().await;
            self.drain_inbox(&mut graph);
            if self.flow_finished {
                break;
            }

            let progressed = if self.control.is_paused() {
                false
            } else if self.control.take_retry_request() && self.retry_all_failures(&mut graph) {
                true
            } else {
                self.progress_graph(&mut graph)
            };

            if progressed || self.dirty {
                self.persist(&graph).await;
            }
            if self.flow_finished {
                break;
            }
            if progressed {
                continue;
            }
            drop(graph);
            self.wait_for_work().await;
        }

        self.shutdown().await
    }

    fn start_flow(&mut self, graph: &mut ExecutableGraph) {
        let now = Utc::now();
        let root = graph.root();
        let common = common_flow_props(graph, now, self.web_url.as_deref());
        let inputs = root_input_props(graph, &common);

        let node = graph.node_mut(root);
        node.set_input_props(inputs);
        if !node.set_status(Status::Running) {
            node.force_status(Status::Running);
        }
        node.set_start_time(now);
        self.events.emit(ExecutionEvent::FlowStarted {
            execution_id: self.execution_id,
            flow_id: graph.flow_id.clone(),
            timestamp: now,
        });
        self.emit_status(graph, root);

        if self.control.is_killed() {
            self.apply_kill(graph);
        }
        if graph.children(root).is_empty() {
            tracing::info!("Flow {} has no nodes", self.execution_id);
            self.finalize_flow(graph, root);
            return;
        }

        let starts = graph.start_nodes(root).to_vec();
        if self.control.is_paused() {
            graph.node_mut(root).set_status(Status::Paused);
            self.emit_status(graph, root);
            self.held_back.extend(starts);
            return;
        }
        for start in starts {
            self.run_ready_job(graph, start);
        }
    }

    fn drain_inbox(&mut self, graph: &mut ExecutableGraph) {
        while let Ok(update) = self.job_rx.try_recv() {
            self.backlog.push_back(Inbox::Job(update));
        }
        while let Ok(request) = self.control_rx.try_recv() {
            self.backlog.push_back(Inbox::Control(request));
        }
        while let Some(item) = self.backlog.pop_front() {
            self.dirty = true;
            match item {
                Inbox::Job(JobUpdate::Started { node, attempt, time }) => self.job_started(graph, node, attempt, time),
                Inbox::Job(JobUpdate::Finished(outcome)) => self.job_finished(graph, outcome),
                Inbox::Control(request) => self.handle_request(graph, request),
            }
        }
    }

    fn job_started(&mut self, graph: &mut ExecutableGraph, id: NodeId, attempt: u32, time: DateTime<Utc>) {
        if self.active.get(&id) != Some(&attempt) {
            tracing::debug!("Ignoring start of stale attempt {} of node {:?}", attempt, id);
            return;
        }
        let node = graph.node_mut(id);
        if node.status() != Status::Killing {
            node.set_status(Status::Running);
        }
        node.set_start_time(time);
        self.events.emit(ExecutionEvent::JobStarted {
            execution_id: self.execution_id,
            nested_id: node.nested_id.clone(),
            attempt,
            timestamp: time,
        });
        self.emit_status(graph, id);
    }

    fn job_finished(&mut self, graph: &mut ExecutableGraph, outcome: JobOutcome) {
        let id = outcome.node;
        if self.active.get(&id) != Some(&outcome.attempt) {
            tracing::debug!("Ignoring outcome of stale attempt {} of node {:?}", outcome.attempt, id);
            return;
        }
        self.active.remove(&id);
        self.control.unregister_job(id);

        let node = graph.node_mut(id);
        let status = if node.status() == Status::Killing {
            Status::Killed
        } else {
            outcome.status
        };
        if node.start_time().is_none() {
            if let Some(start) = outcome.start_time {
                node.set_start_time(start);
            }
        }
        node.set_end_time(outcome.end_time);
        if let Some(outputs) = outcome.output_props {
            node.set_output_props(outputs);
        }
        if let Some(message) = outcome.failure_message {
            node.set_failure_message(message);
        }
        if !node.set_status(status) && !node.status().is_terminal() {
            node.force_status(status);
        }

        // a failure that cancels everything also ends the pause
        let retries_left = node.attempt() < node.retries;
        if status == Status::Failed
            && !retries_left
            && self.control.is_paused()
            && graph.options.failure_action == FailureAction::CancelAll
        {
            tracing::info!("Job {} failed while flow {} is paused, resuming", graph.node(id).nested_id, self.execution_id);
            self.control.set_paused(false);
            self.restore_after_pause(graph);
        }
        self.finish_node(graph, id);
    }

    fn handle_request(&mut self, graph: &mut ExecutableGraph, request: ControlRequest) {
        let root = graph.root();
        match request {
            ControlRequest::Pause { user } => {
                if graph.node_mut(root).set_status(Status::Paused) {
                    tracing::info!("Flow {} is paused by {}", self.execution_id, user);
                    self.emit_status(graph, root);
                }
            }
            ControlRequest::Resume { user } => {
                tracing::info!("Flow {} is resumed by {}", self.execution_id, user);
                self.restore_after_pause(graph);
            }
            ControlRequest::Kill { user } => {
                tracing::info!("Flow {} is killed by {}", self.execution_id, user);
                self.apply_kill(graph);
            }
            ControlRequest::RetryFailures { .. } => {}
        }
    }

    fn restore_after_pause(&mut self, graph: &mut ExecutableGraph) {
        let root = graph.root();
        if graph.status() != Status::Paused {
            return;
        }
        let status = if self.control.is_killed() {
            Status::Killing
        } else if self.control.is_failed() {
            Status::FailedFinishing
        } else {
            Status::Running
        };
        graph.node_mut(root).force_status(status);
        self.emit_status(graph, root);
    }

    /// Move the flow and everything in flight to KILLING. Job runners were
    /// already cancelled through [`ControlState::kill`].
    fn apply_kill(&mut self, graph: &mut ExecutableGraph) {
        let root = graph.root();
        if graph.status().is_terminal() {
            return;
        }
        if graph.node_mut(root).set_status(Status::Killing) {
            self.emit_status(graph, root);
        }
        let in_flight: Vec<NodeId> = graph
            .nodes()
            .filter(|(id, node)| {
                *id != root
                    && matches!(
                        node.status(),
                        Status::Queued | Status::Running | Status::Paused | Status::FailedFinishing
                    )
            })
            .map(|(id, _)| id)
            .collect();
        for id in in_flight {
            if graph.node_mut(id).set_status(Status::Killing) {
                self.emit_status(graph, id);
            }
        }
        self.dirty = true;
    }

    /// Walk from every node finished since the last pass. Returns whether
    /// anything changed.
    fn progress_graph(&mut self, graph: &mut ExecutableGraph) -> bool {
        let finished = std::mem::take(&mut self.finished);
        let mut candidates: Vec<NodeId> = Vec::new();

        for &id in &finished {
            if graph.node(id).status() == Status::Failed {
                if self.retry_job_if_possible(graph, id) {
                    candidates.push(id);
                    continue;
                }
                self.set_flow_failed(graph, id);
            }

            let node = graph.node(id);
            if node.out_nodes.is_empty() {
                if let Some(parent) = node.parent {
                    if self.is_flow_ready_to_finalize(graph, parent) {
                        self.finalize_flow(graph, parent);
                        // the sub-flow is walked like any finished node next pass
                        if parent != graph.root() {
                            self.finish_node(graph, parent);
                        }
                    }
                }
            } else {
                candidates.extend(node.out_nodes.iter().copied());
            }
        }
        candidates.extend(std::mem::take(&mut self.held_back));

        let mut seen = HashSet::new();
        let mut ran = false;
        for id in candidates {
            if seen.insert(id) {
                ran |= self.run_ready_job(graph, id);
            }
        }
        ran || !finished.is_empty()
    }

    fn is_flow_ready_to_finalize(&self, graph: &ExecutableGraph, flow: NodeId) -> bool {
        !graph.node(flow).status().is_terminal()
            && graph
                .end_nodes(flow)
                .iter()
                .all(|end| graph.node(*end).status().is_terminal())
    }

    /// Start `id` if it became eligible. Returns whether its status changed.
    fn run_ready_job(&mut self, graph: &mut ExecutableGraph, id: NodeId) -> bool {
        let status = graph.node(id).status();
        if status.is_terminal() || status.is_in_flight() || self.active.contains_key(&id) {
            return false;
        }
        let Some(next) = self.implied_status(graph, id) else {
            return false;
        };

        match next {
            Status::Cancelled => {
                self.cancel_node(graph, id);
                self.finish_node(graph, id);
            }
            Status::Skipped => {
                self.skip_node(graph, id);
                self.finish_node(graph, id);
            }
            _ if graph.is_flow(id) => self.start_sub_flow(graph, id),
            _ => {
                if !self.pipeline_allows(graph, id) {
                    tracing::debug!("Job {} waits for the pipelined execution", graph.node(id).nested_id);
                    self.held_back.insert(id);
                    return false;
                }
                self.held_back.remove(&id);
                self.dispatch_job(graph, id);
            }
        }
        true
    }

    /// What a READY or DISABLED node should become now, or `None` while its
    /// predecessors are still running.
    fn implied_status(&self, graph: &ExecutableGraph, id: NodeId) -> Option<Status> {
        let node = graph.node(id);
        let predecessors: Vec<Status> = node.in_nodes.iter().map(|p| graph.node(*p).status()).collect();

        let condition_met = match node.condition_on_job_status.evaluate(&predecessors) {
            ConditionOutcome::Pending => return None,
            ConditionOutcome::Unsatisfied => false,
            ConditionOutcome::Satisfied => node.condition.as_ref().map_or(true, |condition| {
                condition.evaluate(|job, key| {
                    node.in_nodes
                        .iter()
                        .map(|p| graph.node(*p))
                        .find(|p| p.id == job)
                        .and_then(|p| p.output_props())
                        .and_then(|props| props.get(key))
                })
            }),
        };

        let only_skipped_upstream =
            !predecessors.is_empty() && predecessors.iter().all(|s| *s == Status::Skipped);
        if matches!(node.status(), Status::Disabled | Status::Skipped) || only_skipped_upstream {
            return Some(Status::Skipped);
        }

        let cancel_on_failure =
            self.control.is_failed() && graph.options.failure_action == FailureAction::FinishCurrentlyRunning;
        if cancel_on_failure || self.control.is_killed() || !condition_met {
            return Some(Status::Cancelled);
        }
        Some(Status::Ready)
    }

    fn pipeline_allows(&self, graph: &ExecutableGraph, id: NodeId) -> bool {
        match (graph.options.pipeline(), &self.watcher) {
            (Some((_, level)), Some(watcher)) => watcher.is_satisfied(&graph.node(id).nested_id, level),
            _ => true,
        }
    }

    fn cancel_node(&mut self, graph: &mut ExecutableGraph, id: NodeId) {
        let now = Utc::now();
        let node = graph.node_mut(id);
        let status = if node.status() == Status::Disabled {
            Status::Skipped
        } else {
            Status::Cancelled
        };
        if !node.set_status(status) {
            node.force_status(status);
        }
        node.set_start_time(now);
        node.set_end_time(now);
        tracing::info!("Node {} of flow {} set to {}", node.nested_id, self.execution_id, status);
    }

    fn skip_node(&mut self, graph: &mut ExecutableGraph, id: NodeId) {
        let now = Utc::now();
        let node = graph.node_mut(id);
        if !node.set_status(Status::Skipped) {
            node.force_status(Status::Skipped);
        }
        node.set_start_time(now);
        node.set_end_time(now);
        tracing::info!("Node {} of flow {} skipped", node.nested_id, self.execution_id);
    }

    fn start_sub_flow(&mut self, graph: &mut ExecutableGraph, id: NodeId) {
        let inputs = node_input_props(graph, id);
        let node = graph.node_mut(id);
        node.set_input_props(inputs);
        node.set_status(Status::Running);
        node.set_start_time(Utc::now());
        tracing::info!("Starting sub-flow {} of flow {}", node.nested_id, self.execution_id);
        self.emit_status(graph, id);

        let starts = graph.start_nodes(id).to_vec();
        if starts.is_empty() {
            self.finalize_flow(graph, id);
            self.finish_node(graph, id);
            return;
        }
        for start in starts {
            self.run_ready_job(graph, start);
        }
    }

    fn dispatch_job(&mut self, graph: &mut ExecutableGraph, id: NodeId) {
        let inputs = node_input_props(graph, id);
        let submit_user = graph.submit_user.clone();
        let proxy_users = graph.proxy_users.clone();

        let node = graph.node_mut(id);
        node.set_input_props(inputs.clone());
        node.set_status(Status::Queued);
        let delay = Duration::from_millis(node.delayed_execution_ms());
        node.set_delayed_execution_ms(0);
        let attempt = node.attempt();
        let spec = JobSpec {
            node: id,
            nested_id: node.nested_id.clone(),
            job_type: node.job_type().unwrap_or_default().to_string(),
            attempt,
            props: inputs,
            delay,
        };
        tracing::info!(
            "Submitting job {} of flow {} (attempt {})",
            spec.nested_id,
            self.execution_id,
            attempt
        );

        let token = CancellationToken::new();
        self.control.register_job(id, token.clone());
        self.active.insert(id, attempt);

        let mut runner = JobRunner::new(self.execution_id, spec, self.job_types.clone(), self.job_tx.clone())
            .with_loader(self.loader.clone())
            .with_execution_dir(self.execution_dir.clone())
            .with_permits(self.permits.clone())
            .with_cancellation(token)
            .with_submit_user(submit_user);
        if self.validate_proxy_user {
            runner = runner.with_proxy_validation(proxy_users);
        }

        let updates = self.job_tx.clone();
        let execution_id = self.execution_id;
        self.jobs.spawn(async move {
            if AssertUnwindSafe(runner.run()).catch_unwind().await.is_err() {
                tracing::error!("Job node {:?} of flow {} panicked", id, execution_id);
                let _ = updates.send(JobUpdate::Finished(JobOutcome {
                    node: id,
                    attempt,
                    status: Status::Failed,
                    start_time: None,
                    end_time: Utc::now(),
                    output_props: None,
                    failure_message: Some("job panicked".to_string()),
                }));
            }
        });
        self.emit_status(graph, id);
    }

    /// Re-arm a failed job that has retries left.
    fn retry_job_if_possible(&mut self, graph: &mut ExecutableGraph, id: NodeId) -> bool {
        let node = graph.node(id);
        if node.is_flow() || node.attempt() >= node.retries || self.control.is_killed() {
            return false;
        }
        let backoff = node.retry_backoff_ms;
        tracing::info!(
            "Job {} failed on attempt {}, retrying in {} ms ({} retries)",
            node.nested_id,
            node.attempt(),
            backoff,
            node.retries
        );
        let node = graph.node_mut(id);
        node.reset_for_retry();
        node.set_delayed_execution_ms(backoff);
        self.emit_status(graph, id);
        true
    }

    fn set_flow_failed(&mut self, graph: &mut ExecutableGraph, id: NodeId) {
        let node = graph.node(id);
        let should_fail = node.out_nodes.is_empty()
            || node
                .out_nodes
                .iter()
                .any(|out| graph.node(*out).condition_on_job_status == ConditionOnJobStatus::AllSuccess);
        if !should_fail {
            tracing::info!("Failure of {} is handled by its successors", node.nested_id);
            return;
        }

        let nested_id = node.nested_id.clone();
        let parent = node.parent;
        tracing::info!("Flow {} is failing because of {}", self.execution_id, nested_id);
        graph.record_failed_job(&nested_id);
        if let Some(parent) = parent {
            self.propagate_failure(graph, parent);
        }
        self.control.set_failed();

        if graph.options.failure_action == FailureAction::CancelAll && self.control.kill() {
            tracing::info!("Cancelling all jobs of flow {}", self.execution_id);
            self.apply_kill(graph);
        }
    }

    /// Mark `flow` and its ancestors FAILED_FINISHING.
    fn propagate_failure(&mut self, graph: &mut ExecutableGraph, flow: NodeId) {
        let mut current = Some(flow);
        while let Some(id) = current {
            let status = graph.node(id).status();
            if status.is_terminal() || status == Status::Killing {
                break;
            }
            if status != Status::FailedFinishing && graph.node_mut(id).set_status(Status::FailedFinishing) {
                self.emit_status(graph, id);
            }
            current = graph.parent(id);
        }
    }

    /// Settle the final status of a flow whose end nodes are all terminal.
    fn finalize_flow(&mut self, graph: &mut ExecutableGraph, flow: NodeId) {
        let succeeded = graph.end_nodes(flow).iter().all(|end| {
            !matches!(
                graph.node(*end).status(),
                Status::Killed | Status::Killing | Status::Failed | Status::Cancelled
            )
        });
        let outputs = flow_output_props(graph, flow);

        let node = graph.node_mut(flow);
        node.set_output_props(outputs);
        if !succeeded && node.status() == Status::Running {
            node.set_status(Status::Killed);
        }
        let status = match node.status() {
            Status::FailedFinishing => Status::Failed,
            Status::Killing => Status::Killed,
            status @ (Status::Failed | Status::Killed | Status::Cancelled) => status,
            _ => Status::Succeeded,
        };
        if node.status() != status && !node.set_status(status) {
            node.force_status(status);
        }
        node.set_end_time(Utc::now());

        if flow == graph.root() {
            tracing::info!("Flow {} finalized as {}", self.execution_id, status);
            self.flow_finished = true;
            self.control.mark_finished();
        } else {
            tracing::info!("Sub-flow {} of flow {} finalized as {}", graph.node(flow).nested_id, self.execution_id, status);
        }
        self.emit_status(graph, flow);
    }

    fn retry_all_failures(&mut self, graph: &mut ExecutableGraph) -> bool {
        let root = graph.root();
        if !graph.any_below(root, &|node| node.status().is_failure()) {
            tracing::info!("Flow {} has no failed jobs to retry", self.execution_id);
            return false;
        }
        tracing::info!("Retrying all failures of flow {}", self.execution_id);

        self.control.rearm();
        graph.clear_failed_job();
        graph.node_mut(root).force_status(Status::Running);
        self.emit_status(graph, root);

        let mut to_retry = Vec::new();
        self.reset_failed_state(graph, root, &mut to_retry);
        for id in to_retry {
            match graph.node(id).status() {
                Status::Ready | Status::Disabled => {
                    self.run_ready_job(graph, id);
                }
                Status::Succeeded => {
                    for out in graph.node(id).out_nodes.clone() {
                        self.run_ready_job(graph, out);
                    }
                }
                _ => {}
            }
        }
        true
    }

    /// Walk `flow` backwards from its end nodes and make failed work
    /// runnable again. Nodes to restart from are collected in `to_retry`.
    fn reset_failed_state(&mut self, graph: &mut ExecutableGraph, flow: NodeId, to_retry: &mut Vec<NodeId>) {
        let mut queue: VecDeque<NodeId> = graph.end_nodes(flow).iter().copied().collect();
        let mut visited = HashSet::new();
        let mut latest_start: Option<DateTime<Utc>> = None;

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let status = graph.node(id).status();
            latest_start = latest_start.max(graph.node(id).start_time());

            match status {
                Status::Succeeded => {
                    to_retry.push(id);
                    continue;
                }
                Status::Running | Status::Queued | Status::Killing => continue,
                Status::Skipped => {
                    graph.node_mut(id).reset_status(Status::Disabled);
                    self.emit_status(graph, id);
                }
                _ => {}
            }

            if graph.is_flow(id) {
                match status {
                    Status::Cancelled => {
                        graph.node_mut(id).reset_status(Status::Ready);
                        self.emit_status(graph, id);
                    }
                    Status::Killed | Status::Failed | Status::FailedFinishing => {
                        self.reset_failed_state(graph, id, to_retry);
                        continue;
                    }
                    _ => continue,
                }
            } else {
                match status {
                    Status::Cancelled => {
                        graph.node_mut(id).reset_status(Status::Ready);
                        self.emit_status(graph, id);
                    }
                    Status::Failed | Status::Killed => {
                        graph.node_mut(id).reset_for_retry();
                        self.emit_status(graph, id);
                        to_retry.push(id);
                    }
                    _ => {}
                }
            }

            queue.extend(graph.node(id).in_nodes.iter().copied());
        }

        if flow != graph.root() {
            if latest_start.is_none() {
                graph.node_mut(flow).reset_status(Status::Ready);
            } else {
                graph.node_mut(flow).force_status(Status::Running);
            }
            self.emit_status(graph, flow);
        }
        if latest_start.is_some() {
            for start in graph.start_nodes(flow).to_vec() {
                if matches!(graph.node(start).status(), Status::Ready | Status::Disabled) {
                    to_retry.push(start);
                }
            }
        }
        graph.node_mut(flow).clear_end_time();
    }

    fn finish_node(&mut self, graph: &ExecutableGraph, id: NodeId) {
        let node = graph.node(id);
        self.finished.push(id);
        self.events.emit(ExecutionEvent::JobFinished {
            execution_id: self.execution_id,
            nested_id: node.nested_id.clone(),
            status: node.status(),
            attempt: node.attempt(),
            timestamp: Utc::now(),
        });
    }

    fn emit_status(&self, graph: &ExecutableGraph, id: NodeId) {
        let node = graph.node(id);
        let timestamp = Utc::now();
        if id == graph.root() {
            self.events.emit(ExecutionEvent::FlowStatusChanged {
                execution_id: self.execution_id,
                status: node.status(),
                timestamp,
            });
        } else {
            self.events.emit(ExecutionEvent::JobStatusChanged {
                execution_id: self.execution_id,
                nested_id: node.nested_id.clone(),
                status: node.status(),
                timestamp,
            });
        }
    }

    async fn persist(&mut self, graph: &ExecutableGraph) {
        self.dirty = false;
        if let Err(e) = self.loader.update_executable_flow(graph).await {
            tracing::error!("Failed to persist flow {}: {}", self.execution_id, e);
        }
    }

    async fn wait_for_work(&mut self) {
        let wake = tokio::select! {
            update = self.job_rx.recv() => Wake::Job(update),
            request = self.control_rx.recv() => Wake::Control(request),
            changed = watcher_changed(&mut self.watcher_changes) => Wake::Watcher(changed),
            Some(_) = self.jobs.join_next(), if !self.jobs.is_empty() => Wake::Joined,
            _ = tokio::time::sleep(self.check_interval) => Wake::Timeout,
        };
        match wake {
            Wake::Job(Some(update)) => self.backlog.push_back(Inbox::Job(update)),
            Wake::Control(Some(request)) => self.backlog.push_back(Inbox::Control(request)),
            Wake::Watcher(false) => self.watcher_changes = None,
            Wake::Job(None) | Wake::Control(None) | Wake::Watcher(true) | Wake::Joined | Wake::Timeout => {}
        }
    }

    async fn shutdown(mut self) -> Status {
        while self.jobs.join_next().await.is_some() {}

        let lock = self.graph.clone();
        let mut graph = lock.write().await;
        self.drain_inbox(&mut graph);
        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        let status = graph.status();
        self.persist(&graph).await;
        self.control.mark_finished();
        self.events.emit(ExecutionEvent::FlowFinished {
            execution_id: self.execution_id,
            status,
            timestamp: Utc::now(),
        });
        tracing::info!("Flow execution {} finished with status {}", self.execution_id, status);
        status
    }
}

async fn watcher_changed(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    match changes {
        Some(receiver) => receiver.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

//! Admission and bookkeeping of flow executions on one executor
//!
//! The [`FlowRunnerManager`] accepts execution ids, loads and claims their
//! graphs, prepares their working directories and runs at most
//! `max_concurrent_flows` of them at a time. Up to `flow_queue_capacity`
//! more may wait for a slot; beyond that submissions are rejected. A cleaner
//! task expires finished flows, kills flows that ran too long and deletes
//! stale execution directories.

use crate::config::ExecutorConfig;
use crate::flow_runner::FlowRunner;
use crate::handle::FlowRunnerHandle;
use crate::preparer::FlowPreparer;
use crate::properties::FLOW_NUM_JOB_THREADS;
use crate::registry::JobTypeManager;
use crate::watcher::FlowWatcher;
use chrono::{DateTime, Utc};
use flowcore::{EventBus, ExecutableGraph, ExecutionId, ExecutorError, ExecutorLoader, ProjectLoader, Status};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const CLEANER_USER: &str = "flow-cleaner";

struct RunningFlow {
    handle: FlowRunnerHandle,
    submitted_at: DateTime<Utc>,
}

/// Capacity held by one admitted flow: either a flow slot or a place in the
/// queue.
enum Reservation {
    Slot(OwnedSemaphorePermit),
    Queued(QueuePlace),
}

/// Given back when dropped.
struct QueuePlace(Arc<Shared>);

impl Drop for QueuePlace {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FinishedFlow {
    graph: ExecutableGraph,
    finished_at: Instant,
}

/// State shared with flow tasks and the cleaner.
struct Shared {
    config: ExecutorConfig,
    loader: Arc<dyn ExecutorLoader>,
    running: RwLock<HashMap<ExecutionId, RunningFlow>>,
    recently_finished: RwLock<HashMap<ExecutionId, FinishedFlow>>,
    flow_slots: Arc<Semaphore>,
    queued: AtomicUsize,
    accepting: AtomicBool,
}

pub struct FlowRunnerManager {
    shared: Arc<Shared>,
    preparer: FlowPreparer,
    job_types: Arc<dyn JobTypeManager>,
    events: EventBus,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl FlowRunnerManager {
    pub fn new(config: ExecutorConfig, loader: Arc<dyn ExecutorLoader>, job_types: Arc<dyn JobTypeManager>) -> Self {
        let preparer = FlowPreparer::new(config.execution_dir.clone());
        let events = EventBus::new(config.event_buffer_size);
        let flow_slots = Arc::new(Semaphore::new(config.max_concurrent_flows.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                loader,
                running: RwLock::new(HashMap::new()),
                recently_finished: RwLock::new(HashMap::new()),
                flow_slots,
                queued: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
            }),
            preparer,
            job_types,
            events,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Copy project files into each execution directory.
    pub fn with_project_loader(mut self, projects: Arc<dyn ProjectLoader>) -> Self {
        self.preparer = self.preparer.with_project_loader(projects);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// Events of every flow run by this manager.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Admit an execution. It starts as soon as a flow slot is free.
    pub async fn submit(&self, execution_id: ExecutionId) -> Result<FlowRunnerHandle, ExecutorError> {
        let shared = &self.shared;
        if !self.is_executor_active() {
            return Err(ExecutorError::ShuttingDown);
        }
        if shared.running.read().await.contains_key(&execution_id) {
            return Err(ExecutorError::AlreadyRunning(execution_id));
        }
        let reservation = self.reserve_capacity()?;

        let graph = shared
            .loader
            .fetch_executable_flow(execution_id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(execution_id))?;
        graph.validate()?;
        if !shared
            .loader
            .claim_execution(execution_id, &shared.config.executor_id)
            .await?
        {
            return Err(ExecutorError::AlreadyClaimed(execution_id));
        }

        let execution_dir = self.preparer.prepare(&graph).await?;
        let watcher = self.pipeline_watcher(&graph).await;
        let threads = job_threads(&graph, shared.config.num_job_threads_per_flow);

        let mut runner = FlowRunner::new(graph, self.job_types.clone(), shared.loader.clone(), self.events.clone())
            .with_config(&shared.config)
            .with_num_job_threads(threads)
            .with_execution_dir(execution_dir);
        if let Some(watcher) = watcher {
            runner = runner.with_watcher(watcher);
        }
        let handle = runner.handle();

        // hold the lock until the entry exists so the task cannot remove it first
        let mut running = shared.running.write().await;
        if running.contains_key(&execution_id) {
            return Err(ExecutorError::AlreadyRunning(execution_id));
        }
        self.tasks
            .spawn(run_flow(shared.clone(), reservation, runner, handle.clone()));
        running.insert(
            execution_id,
            RunningFlow {
                handle: handle.clone(),
                submitted_at: Utc::now(),
            },
        );
        tracing::info!("Submitted flow execution {} ({} threads)", execution_id, threads);
        Ok(handle)
    }

    /// Take a free flow slot, or else a place in the queue. The reservation
    /// is released if admission fails later on.
    fn reserve_capacity(&self) -> Result<Reservation, ExecutorError> {
        let shared = &self.shared;
        if let Ok(permit) = shared.flow_slots.clone().try_acquire_owned() {
            return Ok(Reservation::Slot(permit));
        }
        let capacity = shared.config.flow_queue_capacity;
        match shared
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < capacity).then_some(queued + 1)
            }) {
            Ok(_) => Ok(Reservation::Queued(QueuePlace(shared.clone()))),
            Err(queued) => {
                let running = shared.config.max_concurrent_flows.max(1) - shared.flow_slots.available_permits();
                tracing::warn!("Rejecting submission: {} flows running, {} queued", running, queued);
                Err(ExecutorError::Saturated { running, queued })
            }
        }
    }

    async fn pipeline_watcher(&self, graph: &ExecutableGraph) -> Option<Arc<FlowWatcher>> {
        let (pipelined, level) = graph.options.pipeline()?;
        tracing::info!(
            "Execution {} pipelines on execution {} at level {:?}",
            graph.execution_id,
            pipelined,
            level
        );
        let local = self
            .shared
            .running
            .read()
            .await
            .get(&pipelined)
            .map(|flow| flow.handle.clone());
        Some(match local {
            Some(handle) => FlowWatcher::local(&handle).await,
            None => {
                FlowWatcher::remote(
                    pipelined,
                    self.shared.loader.clone(),
                    self.shared.config.remote_watch_interval(),
                )
                .await
            }
        })
    }

    async fn running_handle(&self, execution_id: ExecutionId) -> Result<FlowRunnerHandle, ExecutorError> {
        self.shared
            .running
            .read()
            .await
            .get(&execution_id)
            .map(|flow| flow.handle.clone())
            .ok_or(ExecutorError::NotRunning(execution_id))
    }

    pub async fn cancel(&self, execution_id: ExecutionId, user: &str) -> Result<(), ExecutorError> {
        self.running_handle(execution_id).await?.kill(user)
    }

    pub async fn pause(&self, execution_id: ExecutionId, user: &str) -> Result<(), ExecutorError> {
        self.running_handle(execution_id).await?.pause(user)
    }

    pub async fn resume(&self, execution_id: ExecutionId, user: &str) -> Result<(), ExecutorError> {
        self.running_handle(execution_id).await?.resume(user)
    }

    pub async fn retry_failures(&self, execution_id: ExecutionId, user: &str) -> Result<(), ExecutorError> {
        self.running_handle(execution_id).await?.retry_failures(user)
    }

    /// Admitted flows, including those waiting for a slot.
    pub async fn num_running_flows(&self) -> usize {
        self.shared.running.read().await.len()
    }

    /// Admitted flows still waiting for a slot.
    pub fn num_queued_flows(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub async fn running_flow_ids(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.shared.running.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn is_running(&self, execution_id: ExecutionId) -> bool {
        self.shared.running.read().await.contains_key(&execution_id)
    }

    /// State of a running or recently finished execution.
    pub async fn executable_graph(&self, execution_id: ExecutionId) -> Option<ExecutableGraph> {
        let handle = self
            .shared
            .running
            .read()
            .await
            .get(&execution_id)
            .map(|flow| flow.handle.clone());
        if let Some(handle) = handle {
            return Some(handle.snapshot().await);
        }
        self.shared
            .recently_finished
            .read()
            .await
            .get(&execution_id)
            .map(|flow| flow.graph.clone())
    }

    pub async fn recently_finished_ids(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.shared.recently_finished.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_executor_active(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Start the periodic cleaner. It stops on shutdown.
    pub fn start_cleaner(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.cleaner_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_kill_check = Instant::now();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                shared.sweep_recently_finished().await;
                if last_kill_check.elapsed() >= shared.config.flow_kill_interval() {
                    shared.kill_overdue_flows().await;
                    last_kill_check = Instant::now();
                }
                shared.clean_execution_dirs().await;
            }
            tracing::info!("Flow cleaner stopped");
        })
    }

    /// One pass of the cleaner, independent of its schedule.
    pub async fn clean_now(&self) {
        self.shared.sweep_recently_finished().await;
        self.shared.kill_overdue_flows().await;
        self.shared.clean_execution_dirs().await;
    }

    /// Stop accepting flows and wait for the admitted ones to finish.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down, waiting for {} flows", self.num_running_flows().await);
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.tasks.close();
        self.tasks.wait().await;
        self.shutdown.cancel();
    }

    /// Kill every admitted flow, then wait for them to finish.
    pub async fn shutdown_now(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        let handles: Vec<FlowRunnerHandle> = self
            .shared
            .running
            .read()
            .await
            .values()
            .map(|flow| flow.handle.clone())
            .collect();
        tracing::warn!("Killing {} flows for shutdown", handles.len());
        for handle in handles {
            let _ = handle.kill("shutdown");
        }
        self.shutdown().await;
    }
}

/// Body of one admitted flow: wait for a slot, run, then move to the
/// recently finished set.
async fn run_flow(shared: Arc<Shared>, reservation: Reservation, runner: FlowRunner, handle: FlowRunnerHandle) {
    let execution_id = runner.execution_id();
    let permit = match reservation {
        Reservation::Slot(permit) => Ok(permit),
        Reservation::Queued(place) => {
            let permit = shared.flow_slots.clone().acquire_owned().await;
            drop(place);
            permit
        }
    };

    let graph = match permit {
        Ok(_permit) => match tokio::spawn(runner.run()).await {
            Ok(_) => handle.snapshot().await,
            Err(e) => {
                tracing::error!("Flow execution {} crashed: {}", execution_id, e);
                fail_and_persist(&shared, &handle).await
            }
        },
        Err(_) => {
            tracing::error!("Flow slots closed before execution {} started", execution_id);
            fail_and_persist(&shared, &handle).await
        }
    };

    shared.recently_finished.write().await.insert(
        execution_id,
        FinishedFlow {
            graph,
            finished_at: Instant::now(),
        },
    );
    shared.running.write().await.remove(&execution_id);
}

async fn fail_and_persist(shared: &Shared, handle: &FlowRunnerHandle) -> ExecutableGraph {
    let graph = handle.force_failed().await;
    if let Err(e) = shared.loader.update_executable_flow(&graph).await {
        tracing::error!("Failed to persist execution {}: {}", graph.execution_id, e);
    }
    graph
}

/// Job concurrency of one flow. The `flow.num.job.threads` parameter may
/// lower the executor default but not raise it.
fn job_threads(graph: &ExecutableGraph, default: usize) -> usize {
    let Some(raw) = graph.options.flow_parameters.get(FLOW_NUM_JOB_THREADS) else {
        return default;
    };
    match raw.trim().parse::<usize>() {
        Ok(threads) if threads > 0 && threads <= default => threads,
        _ => {
            tracing::warn!(
                "Ignoring {}={} for execution {}, using {}",
                FLOW_NUM_JOB_THREADS,
                raw,
                graph.execution_id,
                default
            );
            default
        }
    }
}

impl Shared {
    async fn sweep_recently_finished(&self) {
        let ttl = self.config.recently_finished_ttl();
        let mut finished = self.recently_finished.write().await;
        let before = finished.len();
        finished.retain(|_, flow| flow.finished_at.elapsed() < ttl);
        if finished.len() < before {
            tracing::debug!("Expired {} finished flows", before - finished.len());
        }
    }

    async fn kill_overdue_flows(&self) {
        let Some(max_minutes) = self.config.max_flow_running_minutes else {
            return;
        };
        let limit = chrono::Duration::minutes(max_minutes as i64);
        let now = Utc::now();
        let flows: Vec<(FlowRunnerHandle, DateTime<Utc>)> = self
            .running
            .read()
            .await
            .values()
            .map(|flow| (flow.handle.clone(), flow.submitted_at))
            .collect();

        for (handle, submitted_at) in flows {
            let graph = handle.snapshot().await;
            if !matches!(
                graph.status(),
                Status::Running | Status::Queued | Status::Paused | Status::FailedFinishing
            ) {
                continue;
            }
            let started = graph.node(graph.root()).start_time().unwrap_or(submitted_at);
            if now - started > limit {
                tracing::warn!(
                    "Killing execution {} after running more than {} minutes",
                    handle.execution_id(),
                    max_minutes
                );
                let _ = handle.kill(CLEANER_USER);
            }
        }
    }

    async fn clean_execution_dirs(&self) {
        let root = &self.config.execution_dir;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot list execution dir {}: {}", root.display(), e);
                return;
            }
        };
        let retention = self.config.execution_dir_retention();
        let running: Vec<ExecutionId> = self.running.read().await.keys().copied().collect();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(execution_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ExecutionId>().ok())
            else {
                continue;
            };
            if running.contains(&execution_id) {
                continue;
            }
            let age = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO),
                Err(_) => continue,
            };
            if age < retention {
                continue;
            }
            tracing::info!("Deleting old execution directory {}", entry.path().display());
            if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                tracing::warn!("Failed to delete {}: {}", entry.path().display(), e);
            }
        }
    }
}

//! Pipelining between executions of the same flow
//!
//! A [`FlowWatcher`] mirrors the job statuses of one execution so that another
//! execution can hold a job back until its counterpart has started
//! ([`PipelineLevel::Started`]) or finished ([`PipelineLevel::Finished`]).
//! The watched execution is either running in this process, followed through
//! its events, or elsewhere, polled through the [`ExecutorLoader`].

use crate::handle::FlowRunnerHandle;
use flowcore::{ExecutableGraph, ExecutionEvent, ExecutionId, ExecutorLoader, PipelineLevel, Status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct WatchedState {
    statuses: HashMap<String, Status>,
    stopped: bool,
}

pub struct FlowWatcher {
    execution_id: ExecutionId,
    state: Mutex<WatchedState>,
    changes: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl FlowWatcher {
    fn new(execution_id: ExecutionId) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            execution_id,
            state: Mutex::new(WatchedState::default()),
            changes,
            shutdown: CancellationToken::new(),
        }
    }

    /// Follow an execution running in this process.
    pub async fn local(handle: &FlowRunnerHandle) -> Arc<Self> {
        let watcher = Arc::new(Self::new(handle.execution_id()));
        // subscribe before the snapshot so nothing falls in between
        let events = handle.subscribe();
        watcher.seed(&handle.snapshot().await);

        tracing::info!("Watching local execution {}", watcher.execution_id);
        let follower = watcher.clone();
        let handle = handle.clone();
        tokio::spawn(async move { follower.follow_events(handle, events).await });
        watcher
    }

    /// Poll an execution owned by another executor. The first poll completes
    /// before this returns.
    pub async fn remote(execution_id: ExecutionId, loader: Arc<dyn ExecutorLoader>, interval: Duration) -> Arc<Self> {
        let watcher = Arc::new(Self::new(execution_id));
        tracing::info!("Watching remote execution {} every {:?}", execution_id, interval);
        if watcher.poll(loader.as_ref()).await {
            return watcher;
        }

        let follower = watcher.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires at once and the first poll is done
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = follower.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if follower.poll(loader.as_ref()).await {
                            break;
                        }
                    }
                }
            }
        });
        watcher
    }

    pub fn watched_execution(&self) -> ExecutionId {
        self.execution_id
    }

    /// Whether the counterpart of `nested_id` in the watched execution has
    /// reached `level`. Jobs unknown to the watched execution, and every job
    /// once the watcher stopped, are never held back.
    pub fn is_satisfied(&self, nested_id: &str, level: PipelineLevel) -> bool {
        let state = self.state();
        if state.stopped {
            return true;
        }
        match state.statuses.get(nested_id) {
            None => true,
            Some(status) => match level {
                PipelineLevel::Started => status.has_started(),
                PipelineLevel::Finished => status.is_terminal(),
            },
        }
    }

    pub fn peek_status(&self, nested_id: &str) -> Option<Status> {
        self.state().statuses.get(nested_id).copied()
    }

    /// Receives a new value whenever a watched status changes or the watcher stops.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn stop(&self) {
        {
            let mut state = self.state();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        tracing::info!("Stopped watching execution {}", self.execution_id);
        self.shutdown.cancel();
        self.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    async fn follow_events(&self, handle: FlowRunnerHandle, mut events: broadcast::Receiver<ExecutionEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) if event.execution_id() == self.execution_id => {
                    if self.apply(&event) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        "Watcher of execution {} missed {} events, reloading state",
                        self.execution_id,
                        missed
                    );
                    if self.seed(&handle.snapshot().await) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.stop();
                    break;
                }
            }
        }
    }

    /// Returns `true` once the watched execution is over.
    async fn poll(&self, loader: &dyn ExecutorLoader) -> bool {
        match loader.fetch_executable_flow(self.execution_id).await {
            Ok(Some(graph)) => self.seed(&graph),
            Ok(None) => {
                tracing::warn!("Watched execution {} no longer exists", self.execution_id);
                self.stop();
                true
            }
            Err(e) => {
                tracing::warn!("Failed to poll execution {}: {}", self.execution_id, e);
                false
            }
        }
    }

    /// Replace the mirror with a snapshot. Returns `true` when the watched
    /// flow already finished, which stops the watcher.
    fn seed(&self, graph: &ExecutableGraph) -> bool {
        self.state().statuses = graph.statuses();
        if graph.status().is_terminal() {
            self.stop();
            return true;
        }
        self.notify();
        false
    }

    fn apply(&self, event: &ExecutionEvent) -> bool {
        let update = match event {
            ExecutionEvent::JobStarted { nested_id, .. } => Some((nested_id, Status::Running)),
            ExecutionEvent::JobStatusChanged { nested_id, status, .. }
            | ExecutionEvent::JobFinished { nested_id, status, .. } => Some((nested_id, *status)),
            ExecutionEvent::FlowFinished { .. } => {
                self.stop();
                return true;
            }
            ExecutionEvent::FlowStarted { .. } | ExecutionEvent::FlowStatusChanged { .. } => None,
        };
        if let Some((nested_id, status)) = update {
            self.state().statuses.insert(nested_id.clone(), status);
            self.notify();
        }
        false
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn state(&self) -> MutexGuard<'_, WatchedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for FlowWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

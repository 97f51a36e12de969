//! Operator side of a running flow
//!
//! A [`FlowRunnerHandle`] is the only way to talk to a [`FlowRunner`] once it
//! runs. Requests are validated against [`ControlState`] right away, so the
//! caller gets a synchronous answer, and are then queued for the control loop,
//! which is the only writer of the graph.
//!
//! [`FlowRunner`]: crate::FlowRunner

use crate::watcher::FlowWatcher;
use chrono::Utc;
use flowcore::{EventBus, ExecutableGraph, ExecutionEvent, ExecutionId, ExecutorError, NodeId, Status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Operator requests delivered to the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Pause { user: String },
    Resume { user: String },
    Kill { user: String },
    RetryFailures { user: String },
}

#[derive(Debug, Default)]
pub(crate) struct ControlFlags {
    pub paused: bool,
    pub killed: bool,
    pub failed: bool,
    pub finished: bool,
    pub retry_requested: bool,
}

/// Flags and cancellation tokens shared between a runner and its handles.
#[derive(Default)]
pub(crate) struct ControlState {
    flags: Mutex<ControlFlags>,
    active_jobs: Mutex<HashMap<NodeId, CancellationToken>>,
    watcher: Mutex<Option<Arc<FlowWatcher>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ControlState {
    pub fn flags(&self) -> MutexGuard<'_, ControlFlags> {
        lock(&self.flags)
    }

    pub fn is_killed(&self) -> bool {
        self.flags().killed
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    pub fn is_failed(&self) -> bool {
        self.flags().failed
    }

    pub fn is_finished(&self) -> bool {
        self.flags().finished
    }

    pub fn set_failed(&self) {
        self.flags().failed = true;
    }

    pub fn set_paused(&self, paused: bool) {
        self.flags().paused = paused;
    }

    pub fn mark_finished(&self) {
        self.flags().finished = true;
    }

    pub fn take_retry_request(&self) -> bool {
        std::mem::take(&mut self.flags().retry_requested)
    }

    pub fn set_watcher(&self, watcher: Arc<FlowWatcher>) {
        *lock(&self.watcher) = Some(watcher);
    }

    pub fn watcher(&self) -> Option<Arc<FlowWatcher>> {
        lock(&self.watcher).clone()
    }

    /// Track a dispatched job. A job registered after a kill is cancelled at once.
    pub fn register_job(&self, node: NodeId, token: CancellationToken) {
        let killed = self.is_killed();
        if killed {
            token.cancel();
        }
        lock(&self.active_jobs).insert(node, token);
    }

    pub fn unregister_job(&self, node: NodeId) {
        lock(&self.active_jobs).remove(&node);
    }

    /// Mark the flow killed and cancel everything in flight. Returns `false`
    /// when the flow was already killed.
    pub fn kill(&self) -> bool {
        {
            let mut flags = self.flags();
            if flags.killed {
                return false;
            }
            flags.killed = true;
            flags.paused = false;
        }
        for token in lock(&self.active_jobs).values() {
            token.cancel();
        }
        if let Some(watcher) = self.watcher() {
            watcher.stop();
        }
        true
    }

    /// Clear the kill and failure flags ahead of a manual retry.
    pub fn rearm(&self) {
        let mut flags = self.flags();
        flags.killed = false;
        flags.failed = false;
    }
}

/// Cheap, cloneable reference to a running flow.
#[derive(Clone)]
pub struct FlowRunnerHandle {
    execution_id: ExecutionId,
    graph: Arc<RwLock<ExecutableGraph>>,
    control: Arc<ControlState>,
    requests: mpsc::UnboundedSender<ControlRequest>,
    events: EventBus,
}

impl FlowRunnerHandle {
    pub(crate) fn new(
        execution_id: ExecutionId,
        graph: Arc<RwLock<ExecutableGraph>>,
        control: Arc<ControlState>,
        requests: mpsc::UnboundedSender<ControlRequest>,
        events: EventBus,
    ) -> Self {
        Self {
            execution_id,
            graph,
            control,
            requests,
            events,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Stop dispatching new jobs. Running jobs finish.
    pub fn pause(&self, user: &str) -> Result<(), ExecutorError> {
        {
            let mut flags = self.control.flags();
            if flags.finished {
                return Err(ExecutorError::NotRunning(self.execution_id));
            }
            if flags.killed {
                return Err(ExecutorError::IllegalState(format!(
                    "execution {} is being killed and cannot be paused",
                    self.execution_id
                )));
            }
            if flags.paused {
                return Ok(());
            }
            flags.paused = true;
        }
        tracing::info!("Flow {} paused by {}", self.execution_id, user);
        self.send(ControlRequest::Pause { user: user.to_string() });
        Ok(())
    }

    pub fn resume(&self, user: &str) -> Result<(), ExecutorError> {
        {
            let mut flags = self.control.flags();
            if flags.finished {
                return Err(ExecutorError::NotRunning(self.execution_id));
            }
            if !flags.paused {
                tracing::info!("Flow {} is not paused, ignoring resume from {}", self.execution_id, user);
                return Ok(());
            }
            flags.paused = false;
        }
        tracing::info!("Flow {} resumed by {}", self.execution_id, user);
        self.send(ControlRequest::Resume { user: user.to_string() });
        Ok(())
    }

    /// Kill the flow. Calling it again, or on a finished flow, does nothing.
    pub fn kill(&self, user: &str) -> Result<(), ExecutorError> {
        if self.control.is_finished() {
            return Ok(());
        }
        if self.control.kill() {
            tracing::info!("Flow {} killed by {}", self.execution_id, user);
            self.send(ControlRequest::Kill { user: user.to_string() });
        }
        Ok(())
    }

    /// Re-run failed, killed and cancelled parts of the flow.
    pub fn retry_failures(&self, user: &str) -> Result<(), ExecutorError> {
        {
            let mut flags = self.control.flags();
            if flags.finished {
                return Err(ExecutorError::NotRunning(self.execution_id));
            }
            flags.retry_requested = true;
        }
        tracing::info!("Retry of failed jobs in flow {} requested by {}", self.execution_id, user);
        self.send(ControlRequest::RetryFailures { user: user.to_string() });
        Ok(())
    }

    pub fn is_killed(&self) -> bool {
        self.control.is_killed()
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    /// Copy of the current execution state.
    pub async fn snapshot(&self) -> ExecutableGraph {
        self.graph.read().await.clone()
    }

    pub async fn status(&self) -> Status {
        self.graph.read().await.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Mark the flow FAILED after its runner died without finishing it.
    /// Returns the state to persist.
    pub async fn force_failed(&self) -> ExecutableGraph {
        let mut graph = self.graph.write().await;
        let root = graph.root();
        if !graph.status().is_terminal() {
            let now = Utc::now();
            let node = graph.node_mut(root);
            node.force_status(Status::Failed);
            node.set_end_time(now);
            self.events.emit(ExecutionEvent::FlowFinished {
                execution_id: self.execution_id,
                status: Status::Failed,
                timestamp: now,
            });
        }
        self.control.kill();
        self.control.mark_finished();
        graph.clone()
    }

    fn send(&self, request: ControlRequest) {
        if self.requests.send(request).is_err() {
            tracing::debug!("Flow {} control loop already stopped", self.execution_id);
        }
    }
}

use crate::{ExecutionId, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events emitted while a flow executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    FlowStarted {
        execution_id: ExecutionId,
        flow_id: String,
        timestamp: DateTime<Utc>,
    },
    FlowStatusChanged {
        execution_id: ExecutionId,
        status: Status,
        timestamp: DateTime<Utc>,
    },
    JobStarted {
        execution_id: ExecutionId,
        nested_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    JobStatusChanged {
        execution_id: ExecutionId,
        nested_id: String,
        status: Status,
        timestamp: DateTime<Utc>,
    },
    /// Also emitted for nodes finished without running (skipped, cancelled)
    /// and for sub-flows.
    JobFinished {
        execution_id: ExecutionId,
        nested_id: String,
        status: Status,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    FlowFinished {
        execution_id: ExecutionId,
        status: Status,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::FlowStarted { execution_id, .. }
            | ExecutionEvent::FlowStatusChanged { execution_id, .. }
            | ExecutionEvent::JobStarted { execution_id, .. }
            | ExecutionEvent::JobStatusChanged { execution_id, .. }
            | ExecutionEvent::JobFinished { execution_id, .. }
            | ExecutionEvent::FlowFinished { execution_id, .. } => *execution_id,
        }
    }

    /// Nested id of the node the event is about, if any.
    pub fn nested_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::JobStarted { nested_id, .. }
            | ExecutionEvent::JobStatusChanged { nested_id, .. }
            | ExecutionEvent::JobFinished { nested_id, .. } => Some(nested_id),
            _ => None,
        }
    }
}

/// Fan-out of execution events.
///
/// Every subscriber gets its own bounded buffer. Emitting never waits: a
/// subscriber that falls more than `capacity` events behind loses the oldest
/// ones and is told how many it missed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Run `handler` for every event on a background task until the bus is dropped.
    pub fn listen<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(ExecutionEvent) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Event listener lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_listeners_never_block_emit() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();
        for status in [Status::Running, Status::Paused, Status::Running, Status::Succeeded] {
            bus.emit(ExecutionEvent::FlowStatusChanged {
                execution_id: 3,
                status,
                timestamp: Utc::now(),
            });
        }

        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        let next = receiver.recv().await.unwrap();
        assert_eq!(next.execution_id(), 3);
    }

    #[test]
    fn events_are_tagged_by_type() {
        let event = ExecutionEvent::JobFinished {
            execution_id: 1,
            nested_id: "sub:a".into(),
            status: Status::Succeeded,
            attempt: 0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobFinished");
        assert_eq!(json["status"], "SUCCEEDED");
        assert_eq!(event.nested_id(), Some("sub:a"));
    }
}

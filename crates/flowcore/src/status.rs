use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution state shared by jobs, sub-flows and the root flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ready,
    Disabled,
    Queued,
    Running,
    Paused,
    Killing,
    Succeeded,
    Killed,
    Failed,
    FailedFinishing,
    Cancelled,
    Skipped,
}

impl Status {
    /// Terminal statuses are only ever left through an explicit retry reset.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Killed | Status::Failed | Status::Cancelled | Status::Skipped
        )
    }

    /// Work has been handed out and has not finished yet.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Status::Queued
                | Status::Running
                | Status::Paused
                | Status::Killing
                | Status::FailedFinishing
        )
    }

    /// Statuses that break an `all_success` dependency.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failed | Status::Killed | Status::Cancelled)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    /// Whether the node has been started at some point (used by pipeline level 1).
    pub fn has_started(self) -> bool {
        match self {
            Status::Ready | Status::Disabled | Status::Queued => false,
            Status::Skipped | Status::Cancelled => true,
            other => other.is_in_flight() || other.is_terminal(),
        }
    }

    /// Forward edges of the node/flow state machine.
    ///
    /// Retry resets (`FAILED -> READY`, `CANCELLED -> READY`, `SKIPPED -> DISABLED`) are
    /// not part of this relation; they go through the graph's reset operations.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        if self == next {
            return true;
        }
        match self {
            Ready => matches!(next, Queued | Running | Skipped | Cancelled | Killed),
            Disabled => matches!(next, Skipped),
            Queued => matches!(next, Running | Killing | Killed | Failed | Skipped | Cancelled),
            Running => matches!(
                next,
                Succeeded | Failed | Killed | Killing | Paused | FailedFinishing
            ),
            Paused => matches!(next, Running | FailedFinishing | Killing | Killed),
            FailedFinishing => matches!(next, Failed | Killing | Killed | Paused),
            Killing => matches!(next, Killed),
            Succeeded | Killed | Failed | Cancelled | Skipped => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "READY",
            Status::Disabled => "DISABLED",
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Paused => "PAUSED",
            Status::Killing => "KILLING",
            Status::Succeeded => "SUCCEEDED",
            Status::Killed => "KILLED",
            Status::Failed => "FAILED",
            Status::FailedFinishing => "FAILED_FINISHING",
            Status::Cancelled => "CANCELLED",
            Status::Skipped => "SKIPPED",
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Ready
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

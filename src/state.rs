//! Run and task state machines.
//!
//! A `RunInstance` is one materialization of a graph for a logical time
//! slot; it exclusively owns one `TaskInstance` per task definition.
//! Task instances move through a fixed state machine and every transition
//! is validated - an illegal transition is a core bug, never ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a materialized run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution state of a single task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, no scheduling decision yet.
    None,
    /// Dependencies satisfied, waiting for dispatch (possibly deferred).
    Scheduled,
    /// Handed to the executor backend, waiting for a worker slot.
    Queued,
    /// Executing on the backend.
    Running,
    Success,
    Failed,
    /// Attempt failed with retry budget remaining.
    UpForRetry,
    /// Upstream failure propagated; the task will never run in this run.
    Skipped,
    /// User-initiated cancellation completed.
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::UpForRetry => "up_for_retry",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again except through `clear_task`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether `self -> to` is a legal state machine edge.
    ///
    /// `running -> scheduled` is the sensor reschedule deferral;
    /// `queued -> scheduled` is the dispatch failure return path;
    /// terminal -> `none` is the `clear_task` reset.
    pub fn can_transition(&self, to: TaskState) -> bool {
        use TaskState::*;
        match self {
            None => matches!(to, Scheduled | Skipped | Cancelled),
            Scheduled => matches!(to, Queued | Cancelled),
            Queued => matches!(to, Running | Scheduled | Cancelled),
            Running => matches!(to, Success | Failed | UpForRetry | Scheduled | Cancelled),
            UpForRetry => matches!(to, Scheduled | Cancelled),
            Success | Failed | Skipped | Cancelled => matches!(to, None),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a task state transition violates the state machine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal state transition for task `{task}`: {from} -> {to}")]
pub struct InvalidTransition {
    pub task: String,
    pub from: TaskState,
    pub to: TaskState,
}

/// Aggregate state of a run, recomputed from its task instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// At least one task failed while at least one succeeded.
    PartiallyFailed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PartiallyFailed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One materialization of a graph definition for a logical time slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInstance {
    pub id: RunId,
    pub graph_id: String,
    /// The nominal time period this run represents, independent of when
    /// it actually executes. Immutable for the lifetime of the run.
    pub logical_date: DateTime<Utc>,
    pub state: RunState,
    /// Runs created by `trigger_run`/`backfill` do not advance the
    /// schedule cursor.
    pub manual: bool,
    /// Cancellation was requested; recorded separately from completion
    /// because running tasks only stop cooperatively.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
}

/// Execution record of one task definition within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub run_id: RunId,
    pub key: String,
    pub state: TaskState,
    /// Completed execution attempts (success, failure or retry).
    pub attempts: u32,
    /// Consecutive failed hand-offs to the executor backend. Distinct
    /// from `attempts`: exhausting this budget is a system fault, not a
    /// task failure.
    pub dispatch_attempts: u32,
    /// Earliest wall-clock time the instance may be dispatched again.
    /// Carries retry backoff and sensor reschedule deferrals.
    pub not_before: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn new(run_id: RunId, key: impl Into<String>) -> Self {
        Self {
            run_id,
            key: key.into(),
            state: TaskState::None,
            attempts: 0,
            dispatch_attempts: 0,
            not_before: None,
            cancel_requested: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether the deferral window (if any) has elapsed at `now`.
    pub fn ready_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

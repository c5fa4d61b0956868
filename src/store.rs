//! Run state store.
//!
//! The single source of truth for what has and hasn't executed. All
//! cross-tick scheduler state lives here behind an explicit interface;
//! every mutation takes the store lock, so a task instance's state
//! transition is the unit of mutual exclusion. Run-level aggregates are
//! recomputed from task states on read, never incrementally mutated.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::graph::GraphDefinition;
use crate::state::{InvalidTransition, RunId, RunInstance, RunState, TaskInstance, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown run {0}")]
    UnknownRun(RunId),
    #[error("unknown task `{key}` in run {run_id}")]
    UnknownTask { run_id: RunId, key: String },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

struct RunEntry {
    run: RunInstance,
    tasks: BTreeMap<String, TaskInstance>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, RunEntry>,
    by_slot: HashMap<(String, DateTime<Utc>), RunId>,
    /// Latest slot materialized by the schedule (manual runs excluded).
    cursor: HashMap<String, DateTime<Utc>>,
}

/// In-memory state store. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct StateStore {
    inner: Mutex<Inner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize a run for a logical slot. Idempotent: a second call
    /// for the same (graph, slot) returns the existing instance - this
    /// is the duplicate-scheduling guard.
    pub fn create_run(&self, graph: &GraphDefinition, logical_date: DateTime<Utc>) -> RunInstance {
        self.create_run_inner(graph, logical_date, false)
    }

    /// Manually requested run; does not advance the schedule cursor.
    pub fn trigger_run(&self, graph: &GraphDefinition, logical_date: DateTime<Utc>) -> RunInstance {
        self.create_run_inner(graph, logical_date, true)
    }

    /// Bulk-materialize every slot the policy yields in `[start, end]`.
    pub fn backfill(
        &self,
        graph: &GraphDefinition,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<RunInstance> {
        graph
            .policy
            .slots_between(graph.start_after, start, end, limit)
            .into_iter()
            .map(|slot| self.create_run_inner(graph, slot, true))
            .collect()
    }

    fn create_run_inner(
        &self,
        graph: &GraphDefinition,
        logical_date: DateTime<Utc>,
        manual: bool,
    ) -> RunInstance {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let slot_key = (graph.id.clone(), logical_date);
        if let Some(run_id) = inner.by_slot.get(&slot_key).copied() {
            if !manual {
                // The schedule caught up to a manually created slot;
                // the cursor still has to move past it.
                inner
                    .cursor
                    .entry(graph.id.clone())
                    .and_modify(|cur| *cur = (*cur).max(logical_date))
                    .or_insert(logical_date);
            }
            let existing = &inner.runs[&run_id].run;
            debug!(run_id = %existing.id, graph_id = %graph.id, "run already materialized");
            return existing.clone();
        }

        let run = RunInstance {
            id: RunId::new(),
            graph_id: graph.id.clone(),
            logical_date,
            state: RunState::Pending,
            manual,
            cancel_requested: false,
            created_at: Utc::now(),
        };
        let tasks = graph
            .tasks
            .keys()
            .map(|key| (key.clone(), TaskInstance::new(run.id, key.clone())))
            .collect();

        inner.by_slot.insert(slot_key, run.id);
        if !manual {
            inner
                .cursor
                .entry(graph.id.clone())
                .and_modify(|cur| *cur = (*cur).max(logical_date))
                .or_insert(logical_date);
        }
        info!(
            run_id = %run.id,
            graph_id = %graph.id,
            logical_date = %logical_date,
            manual,
            "materialized run"
        );
        inner.runs.insert(run.id, RunEntry { run: run.clone(), tasks });
        run
    }

    pub fn run(&self, run_id: RunId) -> Option<RunInstance> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.runs.get(&run_id).map(|entry| entry.run.clone())
    }

    /// Runs that have not reached a terminal aggregate state yet.
    pub fn active_runs(&self) -> Vec<RunInstance> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut runs: Vec<RunInstance> = inner
            .runs
            .values()
            .filter(|entry| !entry.run.state.is_terminal())
            .map(|entry| entry.run.clone())
            .collect();
        runs.sort_by(|a, b| (a.created_at, a.id.0).cmp(&(b.created_at, b.id.0)));
        runs
    }

    /// Every run of a graph, terminal or not, oldest slot first.
    pub fn runs_for_graph(&self, graph_id: &str) -> Vec<RunInstance> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut runs: Vec<RunInstance> = inner
            .runs
            .values()
            .filter(|entry| entry.run.graph_id == graph_id)
            .map(|entry| entry.run.clone())
            .collect();
        runs.sort_by_key(|run| run.logical_date);
        runs
    }

    /// Latest slot materialized by the schedule for a graph.
    pub fn latest_slot(&self, graph_id: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.cursor.get(graph_id).copied()
    }

    /// Point-in-time copy of a run's task instances.
    pub fn snapshot(&self, run_id: RunId) -> Option<BTreeMap<String, TaskInstance>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.runs.get(&run_id).map(|entry| entry.tasks.clone())
    }

    pub fn get_task_instance(&self, run_id: RunId, key: &str) -> Result<TaskInstance, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner.runs.get(&run_id).ok_or(StoreError::UnknownRun(run_id))?;
        entry
            .tasks
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTask {
                run_id,
                key: key.to_string(),
            })
    }

    /// Apply a state transition, enforcing the state machine.
    pub fn set_task_state(
        &self,
        run_id: RunId,
        key: &str,
        to: TaskState,
    ) -> Result<TaskInstance, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        apply_transition(entry, run_id, key, to, Utc::now())
    }

    /// Transition with a deferred next-dispatch time: retry backoff
    /// (`running -> up_for_retry`) and sensor reschedule
    /// (`running -> scheduled`).
    pub fn defer_task(
        &self,
        run_id: RunId,
        key: &str,
        to: TaskState,
        resume_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        let mut updated = apply_transition(entry, run_id, key, to, Utc::now())?;
        let instance = entry
            .tasks
            .get_mut(key)
            .expect("transition already resolved the task");
        instance.not_before = Some(resume_at);
        updated.not_before = Some(resume_at);
        Ok(updated)
    }

    /// Count a failed hand-off to the executor backend. Returns the new
    /// consecutive failure count.
    pub fn record_dispatch_failure(&self, run_id: RunId, key: &str) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let instance = task_mut(&mut inner, run_id, key)?;
        instance.dispatch_attempts += 1;
        Ok(instance.dispatch_attempts)
    }

    /// A hand-off succeeded; the dispatch retry budget resets.
    pub fn mark_submitted(&self, run_id: RunId, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let instance = task_mut(&mut inner, run_id, key)?;
        instance.dispatch_attempts = 0;
        Ok(())
    }

    /// Request cancellation of a run.
    ///
    /// Tasks that have not been handed to a worker move straight to
    /// `cancelled`; running tasks are only flagged - cooperative stop is
    /// signalled by the scheduler and completion recorded when the
    /// backend reports back. Terminal tasks are untouched.
    pub fn cancel_run(&self, run_id: RunId) -> Result<RunInstance, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        entry.run.cancel_requested = true;

        let keys: Vec<String> = entry.tasks.keys().cloned().collect();
        let now = Utc::now();
        for key in keys {
            let state = entry.tasks[&key].state;
            match state {
                TaskState::None
                | TaskState::Scheduled
                | TaskState::Queued
                | TaskState::UpForRetry => {
                    apply_transition(entry, run_id, &key, TaskState::Cancelled, now)?;
                }
                TaskState::Running => {
                    entry.tasks.get_mut(&key).expect("key from iteration").cancel_requested = true;
                }
                _ => {}
            }
        }
        info!(run_id = %run_id, "cancellation requested");
        Ok(entry.run.clone())
    }

    /// Reset a terminal task instance to `none` so it can run again.
    /// Reopens the run; this is the rerun-only-failed-tasks mechanism.
    pub fn clear_task(&self, run_id: RunId, key: &str) -> Result<TaskInstance, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        let cleared = apply_transition(entry, run_id, key, TaskState::None, Utc::now())?;
        if entry.run.state.is_terminal() {
            entry.run.state = RunState::Running;
        }
        entry.run.cancel_requested = false;
        info!(run_id = %run_id, task = %key, "task cleared for rerun");
        Ok(cleared)
    }

    /// Recompute the aggregate run state. Marks the run terminal and
    /// returns the new state once every task instance is terminal,
    /// `None` otherwise.
    pub fn finalize_run(&self, run_id: RunId) -> Result<Option<RunState>, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        if entry.run.state.is_terminal() {
            return Ok(None);
        }
        if !entry.tasks.values().all(|inst| inst.state.is_terminal()) {
            return Ok(None);
        }

        let any = |state: TaskState| entry.tasks.values().any(|inst| inst.state == state);
        let aggregate = if entry.run.cancel_requested && any(TaskState::Cancelled) {
            RunState::Cancelled
        } else if any(TaskState::Failed) {
            if any(TaskState::Success) {
                RunState::PartiallyFailed
            } else {
                RunState::Failed
            }
        } else {
            RunState::Succeeded
        };
        entry.run.state = aggregate;
        info!(run_id = %run_id, state = %aggregate, "run reached terminal state");
        Ok(Some(aggregate))
    }
}

fn task_mut<'a>(
    inner: &'a mut Inner,
    run_id: RunId,
    key: &str,
) -> Result<&'a mut TaskInstance, StoreError> {
    let entry = inner
        .runs
        .get_mut(&run_id)
        .ok_or(StoreError::UnknownRun(run_id))?;
    entry
        .tasks
        .get_mut(key)
        .ok_or_else(|| StoreError::UnknownTask {
            run_id,
            key: key.to_string(),
        })
}

/// Validate and apply one transition, with attempt and timestamp
/// bookkeeping. The first non-`none` transition moves the run itself
/// from `pending` to `running`.
fn apply_transition(
    entry: &mut RunEntry,
    run_id: RunId,
    key: &str,
    to: TaskState,
    now: DateTime<Utc>,
) -> Result<TaskInstance, StoreError> {
    let instance = entry
        .tasks
        .get_mut(key)
        .ok_or_else(|| StoreError::UnknownTask {
            run_id,
            key: key.to_string(),
        })?;
    let from = instance.state;
    if !from.can_transition(to) {
        return Err(InvalidTransition {
            task: key.to_string(),
            from,
            to,
        }
        .into());
    }

    if from == TaskState::Running
        && matches!(to, TaskState::Success | TaskState::Failed | TaskState::UpForRetry)
    {
        instance.attempts += 1;
    }
    match to {
        TaskState::Running => instance.started_at = Some(now),
        TaskState::Scheduled => instance.not_before = None,
        TaskState::None => {
            instance.attempts = 0;
            instance.dispatch_attempts = 0;
            instance.not_before = None;
            instance.cancel_requested = false;
            instance.started_at = None;
            instance.finished_at = None;
        }
        _ => {}
    }
    if to.is_terminal() {
        instance.finished_at = Some(now);
    }
    instance.state = to;
    debug!(run_id = %run_id, task = %key, from = %from, to = %to, "task transition");

    if entry.run.state == RunState::Pending && to != TaskState::None {
        entry.run.state = RunState::Running;
    }
    Ok(instance.clone())
}

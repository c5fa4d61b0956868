//! Executor dispatch.
//!
//! The scheduler is polymorphic over a small capability set:
//! `submit(context) -> handle` and `poll(handle) -> status`. Swapping
//! the backend changes throughput and placement, never DAG semantics.
//! Task work itself is a second capability, `TaskAction::execute`,
//! resolved by name through an `ActionRegistry` - the core is
//! indifferent to what an action actually does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::RunId;

/// Raised when the backend cannot accept or track work. Recoverable via
/// the scheduler's bounded dispatch retry, unlike a task failure.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("unknown execution handle {0}")]
    UnknownHandle(ExecHandle),
    #[error("executor backend unavailable: {0}")]
    Unavailable(String),
}

/// Opaque ticket for a submitted task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecHandle(pub Uuid);

impl ExecHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cooperative stop flag shared between the scheduler and a running
/// action. Requesting a stop never interrupts the action; it is up to
/// the action to observe the flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an action sees about the task instance it executes.
///
/// `logical_date` is the immutable logical slot of the owning run;
/// placeholder substitution inside `params` is an external templating
/// concern resolved against it before submission.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub graph_id: String,
    pub task_key: String,
    /// Name resolved against the backend's action registry.
    pub action: String,
    pub logical_date: DateTime<Utc>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub params: HashMap<String, String>,
    pub stop: StopSignal,
}

/// What an execution attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success,
    Failure { message: String },
    /// The waiting condition is not met yet; release the slot and check
    /// again no earlier than `resume_at` (sensor reschedule mode).
    Deferred { resume_at: DateTime<Utc> },
}

/// Polymorphic task work: operators, sensors, anything callable.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<TaskOutcome>;
}

/// Always succeeds. Useful as a placeholder and in tests.
pub struct NoopAction;

#[async_trait]
impl TaskAction for NoopAction {
    async fn execute(&self, _ctx: TaskContext) -> anyhow::Result<TaskOutcome> {
        Ok(TaskOutcome::Success)
    }
}

type ActionFn =
    Box<dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<TaskOutcome>> + Send + Sync>;

struct FnAction(ActionFn);

#[async_trait]
impl TaskAction for FnAction {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<TaskOutcome> {
        (self.0)(ctx).await
    }
}

/// Name -> action lookup used by the built-in backends.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn TaskAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn TaskAction>) {
        self.actions.insert(name.into(), action);
    }

    /// Register a closure-backed action.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
    {
        let wrapped: ActionFn = Box::new(move |ctx| Box::pin(f(ctx)));
        self.register(name, Arc::new(FnAction(wrapped)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskAction>> {
        self.actions.get(name).cloned()
    }
}

/// The executor capability set the scheduler depends on.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Hand over a task instance. Must return quickly; the work itself
    /// runs behind the returned handle.
    async fn submit(&self, ctx: TaskContext) -> Result<ExecHandle, DispatchError>;

    /// Check on a previously submitted instance. A `Finished` status
    /// consumes the handle.
    async fn poll(&self, handle: ExecHandle) -> Result<PollStatus, DispatchError>;
}

/// Backend-reported state of a submitted instance.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    /// Waiting for a worker slot.
    Queued,
    Running,
    Finished(TaskOutcome),
}

async fn run_isolated(action: Arc<dyn TaskAction>, ctx: TaskContext) -> TaskOutcome {
    let key = ctx.task_key.clone();
    match tokio::spawn(async move { action.execute(ctx).await }).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => TaskOutcome::Failure {
            message: format!("{err:#}"),
        },
        Err(join_err) => {
            warn!(task = %key, error = %join_err, "action crashed");
            TaskOutcome::Failure {
                message: format!("action crashed: {join_err}"),
            }
        }
    }
}

/// Runs each submission to completion before `submit` returns. The
/// simplest backend; ordering equals submission order.
pub struct SequentialExecutor {
    registry: Arc<ActionRegistry>,
    done: Mutex<HashMap<ExecHandle, TaskOutcome>>,
}

impl SequentialExecutor {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            done: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ExecutorBackend for SequentialExecutor {
    async fn submit(&self, ctx: TaskContext) -> Result<ExecHandle, DispatchError> {
        let action = self
            .registry
            .get(&ctx.action)
            .ok_or_else(|| DispatchError::UnknownAction(ctx.action.clone()))?;
        let handle = ExecHandle::new();
        let outcome = run_isolated(action, ctx).await;
        self.done
            .lock()
            .expect("executor lock poisoned")
            .insert(handle, outcome);
        Ok(handle)
    }

    async fn poll(&self, handle: ExecHandle) -> Result<PollStatus, DispatchError> {
        let mut done = self.done.lock().expect("executor lock poisoned");
        done.remove(&handle)
            .map(PollStatus::Finished)
            .ok_or(DispatchError::UnknownHandle(handle))
    }
}

enum SlotPhase {
    Queued,
    Running,
    Done(TaskOutcome),
}

/// Local worker pool: every submission runs on its own tokio task,
/// concurrency bounded by a semaphore.
pub struct LocalPoolExecutor {
    registry: Arc<ActionRegistry>,
    permits: Arc<Semaphore>,
    slots: Arc<Mutex<HashMap<ExecHandle, Arc<Mutex<SlotPhase>>>>>,
}

impl LocalPoolExecutor {
    pub fn new(registry: Arc<ActionRegistry>, max_concurrent: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of submissions not yet collected through `poll`.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().expect("executor lock poisoned").len()
    }
}

#[async_trait]
impl ExecutorBackend for LocalPoolExecutor {
    async fn submit(&self, ctx: TaskContext) -> Result<ExecHandle, DispatchError> {
        let action = self
            .registry
            .get(&ctx.action)
            .ok_or_else(|| DispatchError::UnknownAction(ctx.action.clone()))?;

        let handle = ExecHandle::new();
        let phase = Arc::new(Mutex::new(SlotPhase::Queued));
        self.slots
            .lock()
            .expect("executor lock poisoned")
            .insert(handle, Arc::clone(&phase));

        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("executor semaphore closed");
            {
                let mut slot = phase.lock().expect("slot lock poisoned");
                *slot = SlotPhase::Running;
            }
            debug!(task = %ctx.task_key, "worker slot acquired");
            let outcome = run_isolated(action, ctx).await;
            let mut slot = phase.lock().expect("slot lock poisoned");
            *slot = SlotPhase::Done(outcome);
        });
        Ok(handle)
    }

    async fn poll(&self, handle: ExecHandle) -> Result<PollStatus, DispatchError> {
        let mut slots = self.slots.lock().expect("executor lock poisoned");
        let phase = slots
            .get(&handle)
            .ok_or(DispatchError::UnknownHandle(handle))?;
        let status = {
            let slot = phase.lock().expect("slot lock poisoned");
            match &*slot {
                SlotPhase::Queued => PollStatus::Queued,
                SlotPhase::Running => PollStatus::Running,
                SlotPhase::Done(outcome) => PollStatus::Finished(outcome.clone()),
            }
        };
        if matches!(status, PollStatus::Finished(_)) {
            slots.remove(&handle);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context(action: &str) -> TaskContext {
        TaskContext {
            run_id: RunId::new(),
            graph_id: "g".into(),
            task_key: "t".into(),
            action: action.to_string(),
            logical_date: Utc::now(),
            attempt: 1,
            params: HashMap::new(),
            stop: StopSignal::new(),
        }
    }

    fn registry() -> Arc<ActionRegistry> {
        let mut registry = ActionRegistry::new();
        registry.register("noop", Arc::new(NoopAction));
        registry.register_fn("boom", |_ctx| async {
            Ok(TaskOutcome::Failure {
                message: "exploded".into(),
            })
        });
        registry.register_fn("err", |_ctx| async { anyhow::bail!("broken pipe") });
        Arc::new(registry)
    }

    async fn poll_until_finished(
        executor: &dyn ExecutorBackend,
        handle: ExecHandle,
    ) -> TaskOutcome {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match executor.poll(handle).await.unwrap() {
                    PollStatus::Finished(outcome) => break outcome,
                    _ => tokio::task::yield_now().await,
                }
            }
        })
        .await
        .expect("task did not finish in time")
    }

    #[tokio::test]
    async fn sequential_runs_to_completion_on_submit() {
        let executor = SequentialExecutor::new(registry());
        let handle = executor.submit(context("noop")).await.unwrap();
        assert_eq!(
            executor.poll(handle).await.unwrap(),
            PollStatus::Finished(TaskOutcome::Success)
        );
        // The handle is consumed.
        assert!(matches!(
            executor.poll(handle).await,
            Err(DispatchError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn unknown_action_is_a_dispatch_error() {
        let executor = SequentialExecutor::new(registry());
        let err = executor.submit(context("ghost")).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownAction(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn action_error_maps_to_failure_outcome() {
        let executor = SequentialExecutor::new(registry());
        let handle = executor.submit(context("err")).await.unwrap();
        let PollStatus::Finished(TaskOutcome::Failure { message }) =
            executor.poll(handle).await.unwrap()
        else {
            panic!("expected failure outcome");
        };
        assert!(message.contains("broken pipe"));
    }

    #[tokio::test]
    async fn pool_executes_and_consumes_handles() {
        let executor = LocalPoolExecutor::new(registry(), 2);
        let h1 = executor.submit(context("noop")).await.unwrap();
        let h2 = executor.submit(context("boom")).await.unwrap();

        assert_eq!(poll_until_finished(&executor, h1).await, TaskOutcome::Success);
        assert_eq!(
            poll_until_finished(&executor, h2).await,
            TaskOutcome::Failure {
                message: "exploded".into()
            }
        );
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn deferred_outcome_passes_through() {
        let resume = Utc::now() + chrono::Duration::seconds(90);
        let mut registry = ActionRegistry::new();
        registry.register_fn("sensor", move |_ctx| async move {
            Ok(TaskOutcome::Deferred { resume_at: resume })
        });

        let executor = SequentialExecutor::new(Arc::new(registry));
        let handle = executor.submit(context("sensor")).await.unwrap();
        assert_eq!(
            executor.poll(handle).await.unwrap(),
            PollStatus::Finished(TaskOutcome::Deferred { resume_at: resume })
        );
    }

    #[tokio::test]
    async fn stop_signal_is_observable_by_actions() {
        let mut registry = ActionRegistry::new();
        registry.register_fn("obedient", |ctx| async move {
            if ctx.stop.is_requested() {
                Ok(TaskOutcome::Failure {
                    message: "stopped".into(),
                })
            } else {
                Ok(TaskOutcome::Success)
            }
        });
        let executor = SequentialExecutor::new(Arc::new(registry));

        let ctx = context("obedient");
        ctx.stop.request();
        let handle = executor.submit(ctx).await.unwrap();
        assert_eq!(
            poll_until_finished(&executor, handle).await,
            TaskOutcome::Failure {
                message: "stopped".into()
            }
        );
    }
}

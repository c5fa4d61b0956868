//! Scheduler loop.
//!
//! Single-threaded and cooperative: one tick completes fully before the
//! next begins. Each tick reloads definitions (per-graph isolation),
//! materializes due slots per schedule policy, collects executor
//! results under a bounded poll timeout, asks the evaluator what can
//! run, dispatches it, and finally recomputes run aggregates.
//!
//! Task-level failures never reach the loop as errors; a tick only
//! fails on a state machine violation or a vanished store record, and
//! that halts the loop as a core bug.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::evaluator::evaluate;
use crate::executor::{
    DispatchError, ExecHandle, ExecutorBackend, PollStatus, StopSignal, TaskContext, TaskOutcome,
};
use crate::graph::{GraphDefinition, RetryPolicy, TaskDefinition};
use crate::source::GraphSource;
use crate::state::{RunId, RunInstance, TaskInstance, TaskState};
use crate::store::StateStore;

/// Loop timings and bounds.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long to sleep between ticks.
    pub tick_interval: Duration,
    /// Upper bound on a single executor poll call; a timed-out poll is
    /// retried next tick.
    pub poll_timeout: Duration,
    /// Consecutive failed hand-offs tolerated per task instance before
    /// the fatal dispatch alert. Distinct from task-level retries.
    pub dispatch_max_attempts: u32,
    /// Cap on schedule slots materialized per graph per tick.
    pub max_catchup_slots: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(5),
            dispatch_max_attempts: 3,
            max_catchup_slots: 100,
        }
    }
}

/// Fatal system alert: a task instance exhausted its dispatch retries.
/// Surfaced distinctly from task failure - the task is not `failed`,
/// the backend is broken.
#[derive(Debug, Clone)]
pub struct DispatchAlert {
    pub run_id: RunId,
    pub task_key: String,
    pub message: String,
}

struct Inflight {
    handle: ExecHandle,
    stop: StopSignal,
}

/// The cooperative control loop tying graphs, store, evaluator and
/// executor together.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<StateStore>,
    executor: Arc<dyn ExecutorBackend>,
    source: Arc<dyn GraphSource>,
    graphs: BTreeMap<String, Arc<GraphDefinition>>,
    inflight: HashMap<(RunId, String), Inflight>,
    alerts: Vec<DispatchAlert>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<StateStore>,
        executor: Arc<dyn ExecutorBackend>,
        source: Arc<dyn GraphSource>,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            source,
            graphs: BTreeMap::new(),
            inflight: HashMap::new(),
            alerts: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// A graph registered by the last reload.
    pub fn graph(&self, graph_id: &str) -> Option<Arc<GraphDefinition>> {
        self.graphs.get(graph_id).cloned()
    }

    /// Dispatch alerts raised so far; draining them acknowledges.
    pub fn take_alerts(&mut self) -> Vec<DispatchAlert> {
        std::mem::take(&mut self.alerts)
    }

    /// One full scheduling pass at the given instant. Public so tests
    /// and embedders can drive the loop deterministically; `run` calls
    /// it on the tick interval with the wall clock.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.reload_definitions().await;
        self.materialize_due_runs(now);
        self.poll_inflight(now).await?;
        self.evaluate_and_dispatch(now).await?;
        self.finalize_runs()?;
        Ok(())
    }

    /// Reload graph definitions. A definition error in one graph never
    /// blocks the others; the previously loaded version (if any) stays
    /// registered.
    async fn reload_definitions(&mut self) {
        let blobs = match self.source.list_definitions().await {
            Ok(blobs) => blobs,
            Err(err) => {
                warn!(
                    error = %format!("{err:#}"),
                    "graph source unavailable, keeping current definitions"
                );
                return;
            }
        };
        for blob in blobs {
            match GraphDefinition::load(&blob.payload) {
                Ok(graph) => {
                    self.graphs.insert(graph.id.clone(), Arc::new(graph));
                }
                Err(err) => {
                    warn!(origin = %blob.origin, error = %err, "skipping invalid graph definition");
                }
            }
        }
    }

    /// Materialize runs for every due logical slot, honoring catch-up:
    /// false keeps only the most recent missed slot (earlier ones are
    /// permanently skipped), true replays all of them chronologically.
    fn materialize_due_runs(&self, now: DateTime<Utc>) {
        for graph in self.graphs.values() {
            let last = self.store.latest_slot(&graph.id);
            let mut slots = graph.policy.due_slots(
                graph.start_after,
                last,
                now,
                self.config.max_catchup_slots,
            );
            if slots.is_empty() {
                continue;
            }
            if slots.len() == self.config.max_catchup_slots {
                warn!(
                    graph_id = %graph.id,
                    cap = self.config.max_catchup_slots,
                    "due slots truncated at the per-tick cap; the rest follow next tick"
                );
            }
            if !graph.catchup && slots.len() > 1 {
                let latest = slots.pop().expect("slots checked non-empty");
                debug!(
                    graph_id = %graph.id,
                    skipped = slots.len(),
                    "catchup disabled, missed slots skipped"
                );
                slots = vec![latest];
            }
            for slot in slots {
                self.store.create_run(graph, slot);
            }
        }
    }

    /// Collect results for in-flight work. Every poll is bounded by the
    /// configured timeout so a slow backend cannot stall the tick.
    async fn poll_inflight(&mut self, now: DateTime<Utc>) -> Result<()> {
        let keys: Vec<(RunId, String)> = self.inflight.keys().cloned().collect();
        for key in keys {
            let Some(entry) = self.inflight.get(&key) else {
                continue;
            };
            let handle = entry.handle;
            let (run_id, task_key) = (key.0, key.1.as_str());

            let polled =
                tokio::time::timeout(self.config.poll_timeout, self.executor.poll(handle)).await;
            let status = match polled {
                Err(_) => {
                    warn!(run_id = %run_id, task = %task_key, "executor poll timed out, retrying next tick");
                    continue;
                }
                Ok(Err(DispatchError::UnknownHandle(_))) => {
                    // The backend lost track of the work; route the
                    // instance back through dispatch.
                    self.inflight.remove(&key);
                    self.store
                        .set_task_state(run_id, task_key, TaskState::Scheduled)?;
                    self.note_dispatch_failure(
                        run_id,
                        task_key,
                        "executor backend lost the execution handle",
                    )?;
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(run_id = %run_id, task = %task_key, error = %err, "executor poll failed");
                    continue;
                }
                Ok(Ok(status)) => status,
            };

            match status {
                PollStatus::Queued => {}
                PollStatus::Running => {
                    let instance = self.store.get_task_instance(run_id, task_key)?;
                    if instance.state == TaskState::Queued {
                        self.store
                            .set_task_state(run_id, task_key, TaskState::Running)?;
                    }
                }
                PollStatus::Finished(outcome) => {
                    self.inflight.remove(&key);
                    self.apply_outcome(run_id, &key.1, outcome, now)?;
                }
            }
        }
        Ok(())
    }

    /// Record a finished execution attempt: success, failure with retry
    /// bookkeeping, or a sensor deferral that re-enters `scheduled`
    /// without holding a slot.
    fn apply_outcome(
        &mut self,
        run_id: RunId,
        task_key: &str,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let instance = self.store.get_task_instance(run_id, task_key)?;
        // Work that finished before ever being observed as running
        // still passes through the full state machine.
        if instance.state == TaskState::Queued {
            self.store
                .set_task_state(run_id, task_key, TaskState::Running)?;
        }

        let retry = self.retry_policy(run_id, task_key);
        match outcome {
            TaskOutcome::Success => {
                self.store
                    .set_task_state(run_id, task_key, TaskState::Success)?;
                info!(run_id = %run_id, task = %task_key, "task succeeded");
            }
            TaskOutcome::Deferred { resume_at } => {
                if instance.cancel_requested {
                    self.store
                        .set_task_state(run_id, task_key, TaskState::Cancelled)?;
                    info!(run_id = %run_id, task = %task_key, "waiting task cancelled");
                } else {
                    self.store
                        .defer_task(run_id, task_key, TaskState::Scheduled, resume_at)?;
                    debug!(run_id = %run_id, task = %task_key, resume_at = %resume_at, "task rescheduled, slot released");
                }
            }
            TaskOutcome::Failure { message } => {
                if instance.cancel_requested {
                    self.store
                        .set_task_state(run_id, task_key, TaskState::Cancelled)?;
                    info!(run_id = %run_id, task = %task_key, "running task stopped after cancellation");
                    return Ok(());
                }
                let attempts_done = instance.attempts + 1;
                if attempts_done >= retry.max_attempts {
                    self.store
                        .set_task_state(run_id, task_key, TaskState::Failed)?;
                    warn!(
                        run_id = %run_id,
                        task = %task_key,
                        attempts = attempts_done,
                        error = %message,
                        "task failed terminally"
                    );
                } else {
                    let delay = retry.backoff.delay_ms(attempts_done);
                    let resume_at = now + chrono::Duration::milliseconds(delay as i64);
                    self.store
                        .defer_task(run_id, task_key, TaskState::UpForRetry, resume_at)?;
                    info!(
                        run_id = %run_id,
                        task = %task_key,
                        attempt = attempts_done,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay,
                        error = %message,
                        "task up for retry"
                    );
                }
            }
        }
        Ok(())
    }

    fn retry_policy(&self, run_id: RunId, task_key: &str) -> RetryPolicy {
        self.store
            .run(run_id)
            .and_then(|run| self.graphs.get(&run.graph_id).cloned())
            .and_then(|graph| graph.task(task_key).map(|def| def.retry))
            .unwrap_or_default()
    }

    /// Ask the evaluator what each active run can do and hand eligible
    /// instances to the executor.
    async fn evaluate_and_dispatch(&mut self, now: DateTime<Utc>) -> Result<()> {
        for run in self.store.active_runs() {
            if run.cancel_requested {
                // No new work; signal running instances to stop.
                for ((inflight_run, _), entry) in &self.inflight {
                    if *inflight_run == run.id {
                        entry.stop.request();
                    }
                }
                continue;
            }
            let Some(graph) = self.graphs.get(&run.graph_id).cloned() else {
                debug!(run_id = %run.id, graph_id = %run.graph_id, "run belongs to an unregistered graph");
                continue;
            };
            let Some(snapshot) = self.store.snapshot(run.id) else {
                continue;
            };

            let evaluation = evaluate(&graph, &snapshot, now);
            for key in &evaluation.skip {
                self.store.set_task_state(run.id, key, TaskState::Skipped)?;
                info!(run_id = %run.id, task = %key, "skipped after upstream failure");
            }
            for key in &evaluation.runnable {
                self.store.set_task_state(run.id, key, TaskState::Scheduled)?;
            }

            // Dispatch whatever is scheduled and past its deferral,
            // including instances returned by earlier dispatch failures.
            let snapshot = self.store.snapshot(run.id).unwrap_or_default();
            for (key, instance) in snapshot {
                if instance.state != TaskState::Scheduled || !instance.ready_at(now) {
                    continue;
                }
                if instance.dispatch_attempts >= self.config.dispatch_max_attempts {
                    // Already alerted; leave the instance parked.
                    continue;
                }
                let Some(def) = graph.task(&key) else {
                    continue;
                };
                self.dispatch_task(&run, def, &instance).await?;
            }
        }
        Ok(())
    }

    async fn dispatch_task(
        &mut self,
        run: &RunInstance,
        def: &TaskDefinition,
        instance: &TaskInstance,
    ) -> Result<()> {
        self.store
            .set_task_state(run.id, &def.key, TaskState::Queued)?;

        let stop = StopSignal::new();
        let ctx = TaskContext {
            run_id: run.id,
            graph_id: run.graph_id.clone(),
            task_key: def.key.clone(),
            action: def.action.clone(),
            logical_date: run.logical_date,
            attempt: instance.attempts + 1,
            params: def.params.clone(),
            stop: stop.clone(),
        };

        match self.executor.submit(ctx).await {
            Ok(handle) => {
                self.store.mark_submitted(run.id, &def.key)?;
                self.inflight
                    .insert((run.id, def.key.clone()), Inflight { handle, stop });
                debug!(run_id = %run.id, task = %def.key, handle = %handle, "dispatched");
            }
            Err(err) => {
                warn!(
                    run_id = %run.id,
                    task = %def.key,
                    error = %err,
                    "dispatch failed, returning task to scheduled"
                );
                self.store
                    .set_task_state(run.id, &def.key, TaskState::Scheduled)?;
                self.note_dispatch_failure(run.id, &def.key, &err.to_string())?;
            }
        }
        Ok(())
    }

    fn note_dispatch_failure(
        &mut self,
        run_id: RunId,
        task_key: &str,
        message: &str,
    ) -> Result<()> {
        let failures = self.store.record_dispatch_failure(run_id, task_key)?;
        if failures >= self.config.dispatch_max_attempts {
            error!(
                run_id = %run_id,
                task = %task_key,
                failures,
                "dispatch attempts exhausted; executor backend needs attention"
            );
            self.alerts.push(DispatchAlert {
                run_id,
                task_key: task_key.to_string(),
                message: message.to_string(),
            });
        }
        Ok(())
    }

    fn finalize_runs(&mut self) -> Result<()> {
        for run in self.store.active_runs() {
            if let Some(state) = self.store.finalize_run(run.id)? {
                info!(run_id = %run.id, graph_id = %run.graph_id, state = %state, "run complete");
            }
        }
        Ok(())
    }

    /// Run the loop until shutdown. Only a core error (state machine
    /// violation, vanished record) halts it.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler loop started"
        );
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %format!("{err:#}"), "tick failed with a core error, halting loop");
                        break;
                    }
                }
            }
        }
    }
}

/// Convenience: spawn the loop and hand back its shutdown switch.
pub fn spawn_scheduler(scheduler: Scheduler) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ActionRegistry, NoopAction, SequentialExecutor};
    use crate::source::StaticSource;
    use crate::state::RunState;
    use async_trait::async_trait;

    const CHAIN: &str = r#"{
        "id": "chain",
        "tasks": [
            {"key": "a", "action": "ok"},
            {"key": "b", "action": "ok", "upstream": ["a"]},
            {"key": "c", "action": "ok", "upstream": ["b"]}
        ]
    }"#;

    fn registry() -> Arc<ActionRegistry> {
        let mut registry = ActionRegistry::new();
        registry.register("ok", Arc::new(NoopAction));
        registry.register_fn("flaky", |_ctx| async {
            Ok(TaskOutcome::Failure {
                message: "flaky".into(),
            })
        });
        Arc::new(registry)
    }

    fn scheduler_over(definitions: &[&str], registry: Arc<ActionRegistry>) -> Scheduler {
        let store = Arc::new(StateStore::new());
        let executor = Arc::new(SequentialExecutor::new(registry));
        let source = Arc::new(StaticSource::from_payloads(
            definitions.iter().map(|s| s.to_string()),
        ));
        Scheduler::new(SchedulerConfig::default(), store, executor, source)
    }

    async fn tick_until_terminal(scheduler: &mut Scheduler, run_id: RunId, max_ticks: usize) {
        let mut now = Utc::now();
        for _ in 0..max_ticks {
            scheduler.tick(now).await.unwrap();
            if scheduler.store().run(run_id).unwrap().state.is_terminal() {
                return;
            }
            now += chrono::Duration::seconds(1);
        }
        panic!("run did not reach a terminal state in {max_ticks} ticks");
    }

    #[tokio::test]
    async fn chain_runs_to_success_in_dependency_order() {
        let mut scheduler = scheduler_over(&[CHAIN], registry());
        scheduler.tick(Utc::now()).await.unwrap();

        let graph = scheduler.graph("chain").unwrap();
        let run = scheduler.store().trigger_run(&graph, Utc::now());
        tick_until_terminal(&mut scheduler, run.id, 10).await;

        let store = scheduler.store();
        assert_eq!(store.run(run.id).unwrap().state, RunState::Succeeded);
        for key in ["a", "b", "c"] {
            let inst = store.get_task_instance(run.id, key).unwrap();
            assert_eq!(inst.state, TaskState::Success, "task {key}");
            assert_eq!(inst.attempts, 1, "task {key}");
        }
    }

    #[tokio::test]
    async fn invalid_definition_does_not_block_others() {
        let broken = r#"{"id": "broken", "tasks": [{"key": "x", "upstream": ["x"]}]}"#;
        let mut scheduler = scheduler_over(&[broken, CHAIN], registry());
        scheduler.tick(Utc::now()).await.unwrap();

        assert!(scheduler.graph("broken").is_none());
        assert!(scheduler.graph("chain").is_some());
    }

    #[tokio::test]
    async fn retries_exhaust_into_terminal_failure() {
        let flaky = r#"{
            "id": "flaky",
            "tasks": [{"key": "only", "action": "flaky", "max_attempts": 3}]
        }"#;
        let mut scheduler = scheduler_over(&[flaky], registry());
        scheduler.tick(Utc::now()).await.unwrap();

        let graph = scheduler.graph("flaky").unwrap();
        let run = scheduler.store().trigger_run(&graph, Utc::now());
        tick_until_terminal(&mut scheduler, run.id, 20).await;

        let inst = scheduler.store().get_task_instance(run.id, "only").unwrap();
        assert_eq!(inst.state, TaskState::Failed);
        assert_eq!(inst.attempts, 3);
        assert_eq!(scheduler.store().run(run.id).unwrap().state, RunState::Failed);
    }

    #[tokio::test]
    async fn catchup_false_materializes_only_the_latest_slot() {
        let now = Utc::now();
        let start = (now - chrono::Duration::days(5)).to_rfc3339();
        let definition = format!(
            r#"{{
                "id": "daily",
                "schedule": {{"type": "interval", "every_seconds": 86400}},
                "catchup": false,
                "start_after": "{start}",
                "tasks": [{{"key": "a", "action": "ok"}}]
            }}"#
        );
        let mut scheduler = scheduler_over(&[definition.as_str()], registry());
        scheduler.tick(now).await.unwrap();

        let runs = scheduler.store().runs_for_graph("daily");
        assert_eq!(runs.len(), 1);
        // Only the most recent due slot survives.
        assert_eq!(runs[0].logical_date, now);

        // The skipped slots never come back.
        scheduler.tick(now).await.unwrap();
        assert_eq!(scheduler.store().runs_for_graph("daily").len(), 1);
    }

    #[tokio::test]
    async fn catchup_true_replays_missed_slots_in_order() {
        let now = Utc::now();
        let start = (now - chrono::Duration::days(5)).to_rfc3339();
        let definition = format!(
            r#"{{
                "id": "daily",
                "schedule": {{"type": "interval", "every_seconds": 86400}},
                "catchup": true,
                "start_after": "{start}",
                "tasks": [{{"key": "a", "action": "ok"}}]
            }}"#
        );
        let mut scheduler = scheduler_over(&[definition.as_str()], registry());
        scheduler.tick(now).await.unwrap();

        let runs = scheduler.store().runs_for_graph("daily");
        assert_eq!(runs.len(), 5);
        for pair in runs.windows(2) {
            assert_eq!(
                pair[1].logical_date - pair[0].logical_date,
                chrono::Duration::days(1)
            );
        }
    }

    struct DownExecutor;

    #[async_trait]
    impl ExecutorBackend for DownExecutor {
        async fn submit(&self, _ctx: TaskContext) -> Result<ExecHandle, DispatchError> {
            Err(DispatchError::Unavailable("connection refused".into()))
        }

        async fn poll(&self, handle: ExecHandle) -> Result<PollStatus, DispatchError> {
            Err(DispatchError::UnknownHandle(handle))
        }
    }

    #[tokio::test]
    async fn dispatch_exhaustion_raises_a_system_alert_not_a_task_failure() {
        let store = Arc::new(StateStore::new());
        let source = Arc::new(StaticSource::from_payloads([
            r#"{"id": "g", "tasks": [{"key": "only", "action": "ok"}]}"#,
        ]));
        let mut scheduler = Scheduler::new(
            SchedulerConfig::default(),
            store,
            Arc::new(DownExecutor),
            source,
        );
        scheduler.tick(Utc::now()).await.unwrap();

        let graph = scheduler.graph("g").unwrap();
        let run = scheduler.store().trigger_run(&graph, Utc::now());
        for _ in 0..5 {
            scheduler.tick(Utc::now()).await.unwrap();
        }

        let alerts = scheduler.take_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].task_key, "only");

        // The task never failed; it is parked in scheduled with zero
        // completed attempts.
        let inst = scheduler.store().get_task_instance(run.id, "only").unwrap();
        assert_eq!(inst.state, TaskState::Scheduled);
        assert_eq!(inst.attempts, 0);
        assert_eq!(inst.dispatch_attempts, 3);
    }
}

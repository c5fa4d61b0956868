//! Dependency evaluation.
//!
//! A pure function of (graph, task-instance snapshot, now): no store
//! access, no clock access, so every scheduling decision is replayable
//! in tests. The scheduler loop applies the returned transitions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::graph::GraphDefinition;
use crate::state::{TaskInstance, TaskState};

/// What the evaluator proposes for one run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Keys eligible for the `none`/`up_for_retry` -> `scheduled`
    /// transition, in task key order.
    pub runnable: Vec<String>,
    /// Keys whose upstream failure propagates a `skipped` transition,
    /// in task key order.
    pub skip: Vec<String>,
}

/// Compute the set of task instances eligible to run now.
///
/// A task is runnable iff its state is `none`, or `up_for_retry` with
/// retry budget remaining, its deferral window has elapsed, and every
/// upstream instance is `success` or `skipped`. Tasks downstream of a
/// terminally `failed` (or `cancelled`) instance are proposed as
/// `skipped` instead, transitively: failed branches halt while sibling
/// branches continue.
pub fn evaluate(
    graph: &GraphDefinition,
    tasks: &BTreeMap<String, TaskInstance>,
    now: DateTime<Utc>,
) -> Evaluation {
    let skip = skip_cascade(graph, tasks);

    let mut runnable = Vec::new();
    for (key, instance) in tasks {
        if skip.contains(key) {
            continue;
        }
        let Some(def) = graph.task(key) else {
            continue;
        };
        let eligible_state = match instance.state {
            TaskState::None => true,
            TaskState::UpForRetry => instance.attempts < def.retry.max_attempts,
            _ => false,
        };
        if !eligible_state || !instance.ready_at(now) {
            continue;
        }

        let upstream_satisfied = def.upstream.iter().all(|up| {
            tasks
                .get(up)
                .is_some_and(|u| matches!(u.state, TaskState::Success | TaskState::Skipped))
        });
        if upstream_satisfied {
            runnable.push(key.clone());
        }
    }

    Evaluation {
        runnable,
        skip: skip.into_iter().collect(),
    }
}

/// Transitive closure of not-yet-started tasks downstream of a failed
/// or cancelled instance.
fn skip_cascade(graph: &GraphDefinition, tasks: &BTreeMap<String, TaskInstance>) -> BTreeSet<String> {
    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|(_, inst)| matches!(inst.state, TaskState::Failed | TaskState::Cancelled))
        .map(|(key, _)| key.as_str())
        .collect();

    let mut skip = BTreeSet::new();
    while let Some(key) = queue.pop_front() {
        for dependent in graph.downstream_of(key) {
            let waiting = tasks
                .get(dependent)
                .is_some_and(|inst| inst.state == TaskState::None);
            if waiting && skip.insert(dependent.to_string()) {
                queue.push_back(dependent);
            }
        }
    }
    skip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunId;

    fn graph(tasks_json: &str) -> GraphDefinition {
        let payload = format!(r#"{{"id": "eval", "tasks": {tasks_json}}}"#);
        GraphDefinition::load(payload.as_bytes()).unwrap()
    }

    fn instances(graph: &GraphDefinition) -> BTreeMap<String, TaskInstance> {
        let run_id = RunId::new();
        graph
            .tasks
            .keys()
            .map(|key| (key.clone(), TaskInstance::new(run_id, key.clone())))
            .collect()
    }

    fn set_state(tasks: &mut BTreeMap<String, TaskInstance>, key: &str, state: TaskState) {
        tasks.get_mut(key).unwrap().state = state;
    }

    #[test]
    fn roots_are_runnable_immediately() {
        let graph = graph(r#"[{"key": "a"}, {"key": "b", "upstream": ["a"]}]"#);
        let tasks = instances(&graph);

        let eval = evaluate(&graph, &tasks, Utc::now());
        assert_eq!(eval.runnable, ["a"]);
        assert!(eval.skip.is_empty());
    }

    #[test]
    fn downstream_waits_for_upstream_success() {
        let graph = graph(r#"[{"key": "a"}, {"key": "b", "upstream": ["a"]}]"#);
        let mut tasks = instances(&graph);

        set_state(&mut tasks, "a", TaskState::Running);
        let eval = evaluate(&graph, &tasks, Utc::now());
        assert!(eval.runnable.is_empty());

        set_state(&mut tasks, "a", TaskState::Success);
        let eval = evaluate(&graph, &tasks, Utc::now());
        assert_eq!(eval.runnable, ["b"]);
    }

    #[test]
    fn skipped_upstream_satisfies_downstream() {
        let graph = graph(r#"[{"key": "a"}, {"key": "b", "upstream": ["a"]}]"#);
        let mut tasks = instances(&graph);

        set_state(&mut tasks, "a", TaskState::Skipped);
        let eval = evaluate(&graph, &tasks, Utc::now());
        assert_eq!(eval.runnable, ["b"]);
    }

    #[test]
    fn failure_cascades_transitively_while_siblings_continue() {
        // a -> b -> d, a -> c -> d is too entangled; keep branches apart:
        // bad -> mid -> leaf cascades, ok stays runnable.
        let graph = graph(
            r#"[
                {"key": "bad"},
                {"key": "mid", "upstream": ["bad"]},
                {"key": "leaf", "upstream": ["mid"]},
                {"key": "ok"}
            ]"#,
        );
        let mut tasks = instances(&graph);
        set_state(&mut tasks, "bad", TaskState::Failed);

        let eval = evaluate(&graph, &tasks, Utc::now());
        assert_eq!(eval.skip, ["leaf", "mid"]);
        assert_eq!(eval.runnable, ["ok"]);
    }

    #[test]
    fn cancelled_upstream_cascades_like_failure() {
        let graph = graph(r#"[{"key": "a"}, {"key": "b", "upstream": ["a"]}]"#);
        let mut tasks = instances(&graph);
        set_state(&mut tasks, "a", TaskState::Cancelled);

        let eval = evaluate(&graph, &tasks, Utc::now());
        assert_eq!(eval.skip, ["b"]);
    }

    #[test]
    fn retry_with_budget_is_runnable_after_deferral() {
        let graph = graph(r#"[{"key": "a", "max_attempts": 3}]"#);
        let mut tasks = instances(&graph);
        let now = Utc::now();

        let inst = tasks.get_mut("a").unwrap();
        inst.state = TaskState::UpForRetry;
        inst.attempts = 1;
        inst.not_before = Some(now + chrono::Duration::seconds(60));

        // Still inside the backoff window.
        assert!(evaluate(&graph, &tasks, now).runnable.is_empty());
        // Window elapsed.
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(evaluate(&graph, &tasks, later).runnable, ["a"]);
    }

    #[test]
    fn retry_without_budget_is_not_offered() {
        let graph = graph(r#"[{"key": "a", "max_attempts": 2}]"#);
        let mut tasks = instances(&graph);

        let inst = tasks.get_mut("a").unwrap();
        inst.state = TaskState::UpForRetry;
        inst.attempts = 2;

        assert!(evaluate(&graph, &tasks, Utc::now()).runnable.is_empty());
    }

    #[test]
    fn started_tasks_are_not_reproposed() {
        let graph = graph(r#"[{"key": "a"}]"#);
        let mut tasks = instances(&graph);

        for state in [
            TaskState::Scheduled,
            TaskState::Queued,
            TaskState::Running,
            TaskState::Success,
        ] {
            set_state(&mut tasks, "a", state);
            assert!(
                evaluate(&graph, &tasks, Utc::now()).runnable.is_empty(),
                "state {state} must not be runnable"
            );
        }
    }
}

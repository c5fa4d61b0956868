//! Immutable graph definitions.
//!
//! A `GraphDefinition` is loaded from a raw JSON blob supplied by the
//! graph source collaborator and validated up front: unique task keys,
//! known upstream references, a positive schedule, and acyclicity. A
//! graph that fails any check is rejected whole - no partial
//! registration.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::SchedulePolicy;

/// Raised when a definition blob cannot become a valid graph.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("invalid definition payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("graph id is empty")]
    EmptyId,
    #[error("graph `{0}` defines no tasks")]
    NoTasks(String),
    #[error("duplicate task key `{0}`")]
    DuplicateTask(String),
    #[error("task `{task}` references unknown upstream `{upstream}`")]
    UnknownUpstream { task: String, upstream: String },
    #[error("dependency cycle among tasks: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("interval must be positive, got {0}")]
    InvalidInterval(i64),
    #[error("graph `{0}` has a schedule but no start_after boundary")]
    MissingStartBoundary(String),
}

/// Delay policy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Immediate retry.
    #[default]
    None,
    /// delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: u64 },
    /// delay = base_delay_ms * multiplier^(attempt_number - 1)
    Exponential { base_delay_ms: u64, multiplier: f64 },
}

impl Backoff {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Linear { .. } => "linear",
            Self::Exponential { .. } => "exponential",
        }
    }

    /// Delay before the next attempt, given the number of attempts
    /// already completed (1-based for the first failure).
    pub fn delay_ms(&self, attempt_number: u32) -> u64 {
        if attempt_number == 0 {
            return 0;
        }
        match self {
            Self::None => 0,
            Self::Linear { base_delay_ms } => base_delay_ms.saturating_mul(attempt_number as u64),
            Self::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                let factor = multiplier.powf((attempt_number - 1) as f64);
                (*base_delay_ms as f64 * factor) as u64
            }
        }
    }
}

/// How many execution attempts a task gets and how long to wait between
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }
}

/// One node of a graph. Immutable once the graph is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub key: String,
    /// Name resolved against the executor's action registry.
    pub action: String,
    /// Raw parameters; placeholder substitution happens outside the core.
    pub params: HashMap<String, String>,
    pub upstream: BTreeSet<String>,
    pub retry: RetryPolicy,
}

// Raw serde shape of a definition blob.
#[derive(Debug, Deserialize)]
struct TaskSpec {
    key: String,
    #[serde(default = "default_action")]
    action: String,
    #[serde(default)]
    params: HashMap<String, String>,
    #[serde(default)]
    upstream: Vec<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default)]
    backoff: Backoff,
}

fn default_action() -> String {
    "noop".to_string()
}

fn default_max_attempts() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct GraphSpec {
    id: String,
    #[serde(default = "default_schedule")]
    schedule: SchedulePolicy,
    #[serde(default)]
    catchup: bool,
    #[serde(default)]
    start_after: Option<DateTime<Utc>>,
    tasks: Vec<TaskSpec>,
}

fn default_schedule() -> SchedulePolicy {
    SchedulePolicy::Manual
}

/// A validated, immutable DAG of task definitions.
#[derive(Debug, Clone)]
pub struct GraphDefinition {
    pub id: String,
    pub tasks: BTreeMap<String, TaskDefinition>,
    pub policy: SchedulePolicy,
    pub catchup: bool,
    /// Logical start boundary: no slot is materialized before it.
    pub start_after: DateTime<Utc>,
    topo: Vec<String>,
    downstream: BTreeMap<String, BTreeSet<String>>,
}

impl GraphDefinition {
    /// Parse and validate a raw definition blob.
    pub fn load(payload: &[u8]) -> Result<Self, DefinitionError> {
        let spec: GraphSpec = serde_json::from_slice(payload)?;
        Self::from_spec(spec)
    }

    fn from_spec(spec: GraphSpec) -> Result<Self, DefinitionError> {
        if spec.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if spec.tasks.is_empty() {
            return Err(DefinitionError::NoTasks(spec.id));
        }
        spec.schedule.validate()?;

        let start_after = match (&spec.schedule, spec.start_after) {
            (SchedulePolicy::Manual, boundary) => {
                boundary.unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
            }
            (_, Some(boundary)) => boundary,
            (_, None) => return Err(DefinitionError::MissingStartBoundary(spec.id)),
        };

        let mut tasks: BTreeMap<String, TaskDefinition> = BTreeMap::new();
        for task in spec.tasks {
            let def = TaskDefinition {
                key: task.key.clone(),
                action: task.action,
                params: task.params,
                upstream: task.upstream.into_iter().collect(),
                retry: RetryPolicy {
                    max_attempts: task.max_attempts.max(1),
                    backoff: task.backoff,
                },
            };
            if tasks.insert(task.key.clone(), def).is_some() {
                return Err(DefinitionError::DuplicateTask(task.key));
            }
        }

        for task in tasks.values() {
            for upstream in &task.upstream {
                if !tasks.contains_key(upstream) {
                    return Err(DefinitionError::UnknownUpstream {
                        task: task.key.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }

        let (topo, downstream) = toposort(&tasks)?;

        Ok(Self {
            id: spec.id,
            tasks,
            policy: spec.schedule,
            catchup: spec.catchup,
            start_after,
            topo,
            downstream,
        })
    }

    pub fn task(&self, key: &str) -> Option<&TaskDefinition> {
        self.tasks.get(key)
    }

    /// Deterministic linearization consistent with every edge, ties
    /// broken by task key ordering. For display and diagnostics only -
    /// execution order is dependency-driven, never list-driven.
    pub fn topological_order(&self) -> &[String] {
        &self.topo
    }

    /// Direct dependents of a task.
    pub fn downstream_of(&self, key: &str) -> impl Iterator<Item = &str> {
        self.downstream
            .get(key)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

/// Kahn's algorithm with a key-ordered ready set. Any node left
/// unvisited after the sort sits on a cycle.
fn toposort(
    tasks: &BTreeMap<String, TaskDefinition>,
) -> Result<(Vec<String>, BTreeMap<String, BTreeSet<String>>), DefinitionError> {
    let mut downstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();

    for (key, task) in tasks {
        indegree.entry(key.as_str()).or_insert(0);
        for upstream in &task.upstream {
            downstream
                .entry(upstream.clone())
                .or_default()
                .insert(key.clone());
            *indegree.entry(key.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(key, _)| *key)
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(key) = ready.pop_first() {
        order.push(key.to_string());
        if let Some(dependents) = downstream.get(key) {
            for dependent in dependents {
                let deg = indegree
                    .get_mut(dependent.as_str())
                    .expect("dependent registered in indegree map");
                *deg -= 1;
                if *deg == 0 {
                    let def = tasks.get(dependent).expect("dependent is a known task");
                    ready.insert(def.key.as_str());
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let mut remainder: Vec<String> = tasks
            .keys()
            .filter(|key| !order.contains(*key))
            .cloned()
            .collect();
        remainder.sort();
        return Err(DefinitionError::Cycle(remainder));
    }

    Ok((order, downstream))
}

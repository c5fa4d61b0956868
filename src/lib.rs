//! Belay - a minimal DAG scheduling and execution-state core.
//!
//! The crate is organized leaf to root: immutable graph definitions,
//! the run/task state machine, the state store, the pure dependency
//! evaluator, schedule policies, and finally the cooperative scheduler
//! loop that ties them to a pluggable executor backend.

pub mod config;
pub mod evaluator;
pub mod executor;
pub mod graph;
pub mod schedule;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod store;

pub use config::Config;
pub use evaluator::{Evaluation, evaluate};
pub use executor::{
    ActionRegistry, DispatchError, ExecHandle, ExecutorBackend, LocalPoolExecutor, PollStatus,
    SequentialExecutor, StopSignal, TaskAction, TaskContext, TaskOutcome,
};
pub use graph::{Backoff, DefinitionError, GraphDefinition, RetryPolicy, TaskDefinition};
pub use schedule::SchedulePolicy;
pub use scheduler::{DispatchAlert, Scheduler, SchedulerConfig, spawn_scheduler};
pub use source::{DefinitionBlob, DirectorySource, GraphSource, StaticSource};
pub use state::{InvalidTransition, RunId, RunInstance, RunState, TaskInstance, TaskState};
pub use store::{StateStore, StoreError};

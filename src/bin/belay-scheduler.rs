//! Belay scheduler daemon.
//!
//! Watches a directory of JSON graph definitions and runs the
//! scheduling loop against a local executor backend.
//!
//! Usage:
//!   cargo run --bin belay-scheduler -- --definitions ./graphs
//!
//! Log verbosity comes from `BELAY_LOG` (tracing env-filter syntax).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use belay::{
    ActionRegistry, Config, DirectorySource, ExecutorBackend, LocalPoolExecutor, Scheduler,
    SequentialExecutor, StateStore, TaskAction, TaskContext, TaskOutcome, executor::NoopAction,
    spawn_scheduler,
};

#[derive(Parser, Debug)]
#[command(name = "belay-scheduler", about = "Run the belay scheduling loop")]
struct Args {
    /// Directory of JSON graph definitions
    #[arg(short, long)]
    definitions: Option<PathBuf>,

    /// Scheduler tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Worker slots for the local pool executor
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Run tasks one at a time instead of on the local pool
    #[arg(long)]
    sequential: bool,
}

/// Runs the `command` parameter through `sh -c`.
struct ShellAction;

#[async_trait]
impl TaskAction for ShellAction {
    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome> {
        let Some(command) = ctx.params.get("command") else {
            bail!("shell action requires a `command` parameter");
        };
        if ctx.stop.is_requested() {
            return Ok(TaskOutcome::Failure {
                message: "stopped before start".into(),
            });
        }

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("spawning `{command}`"))?;

        if status.success() {
            Ok(TaskOutcome::Success)
        } else {
            Ok(TaskOutcome::Failure {
                message: format!("exit status {status}"),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(tick_ms) = args.tick_ms {
        config.tick_interval_ms = tick_ms;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    let definitions = args
        .definitions
        .or_else(|| config.definitions_dir.clone())
        .context("no definitions directory; pass --definitions or set BELAY_DEFINITIONS_DIR")?;

    let mut registry = ActionRegistry::new();
    registry.register("noop", Arc::new(NoopAction));
    registry.register("shell", Arc::new(ShellAction));
    let registry = Arc::new(registry);

    let executor: Arc<dyn ExecutorBackend> = if args.sequential {
        Arc::new(SequentialExecutor::new(registry))
    } else {
        Arc::new(LocalPoolExecutor::new(registry, config.max_concurrent))
    };

    let scheduler = Scheduler::new(
        config.scheduler_config(),
        Arc::new(StateStore::new()),
        executor,
        Arc::new(DirectorySource::new(&definitions)),
    );

    info!(definitions = %definitions.display(), "starting belay scheduler");
    let (handle, shutdown_tx) = spawn_scheduler(scheduler);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(true);
    handle.await.context("scheduler task panicked")?;
    Ok(())
}

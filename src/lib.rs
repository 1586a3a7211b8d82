//! Core library for the `hatchling` load-generation worker.
//!
//! An embedder defines weighted [`Task`]s and hands them to [`run`]. The
//! worker connects to a master, hatches virtual users on command,
//! optionally throttles them under a global requests-per-second ceiling,
//! and streams aggregated request statistics upstream. Request outcomes
//! are reported by the embedder's task code through the process-wide
//! [event bus](events::events).

pub mod args;
pub mod client;
pub mod error;
pub mod events;
pub mod limiter;
pub mod logger;
pub mod profile;
pub mod runner;
pub mod stats;
pub mod task;

mod shutdown;
mod util;

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{info, warn};

pub use args::{HatchType, WorkerArgs};
pub use error::{AppError, AppResult};
pub use events::{Event, EventBus, events, topics};
pub use limiter::{RateLimiter, StableRateLimiter, WarmUpRateLimiter};
pub use runner::{Runner, RunnerState};
pub use task::Task;

static INITTED: AtomicBool = AtomicBool::new(false);

/// Parses the CLI surface and drives the worker until shutdown.
///
/// With `--run-tasks` the named tasks execute once inline and the worker
/// exits without connecting to the master.
///
/// # Errors
///
/// Returns an error on malformed configuration or when the master is
/// unreachable.
///
/// # Panics
///
/// Panics if called more than once in a process lifetime.
pub fn run(tasks: Vec<Task>) -> AppResult<()> {
    let args = WorkerArgs::parse();
    run_with_args(args, tasks)
}

/// [`run`] with pre-parsed arguments, for embedding and tests.
///
/// # Errors
///
/// Returns an error on malformed configuration or when the master is
/// unreachable.
///
/// # Panics
///
/// Panics if called more than once in a process lifetime.
pub fn run_with_args(args: WorkerArgs, tasks: Vec<Task>) -> AppResult<()> {
    logger::init_logging();

    if !args.run_tasks.is_empty() {
        return run_tasks_inline(&args.run_tasks, &tasks);
    }

    if INITTED.swap(true, Ordering::SeqCst) {
        panic!("Do not call run() more than once per process");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_worker(args, tasks))
}

async fn run_worker(args: WorkerArgs, tasks: Vec<Task>) -> AppResult<()> {
    let (shutdown_tx, _) = shutdown::shutdown_channel();
    let stats = stats::start_stats_collector(&shutdown_tx);

    let runner = Runner::new(tasks, &args, stats)?;
    runner.get_ready().await?;

    if let Some(path) = args.mem_profile.as_deref() {
        drop(profile::start_memory_profile(path, args.mem_profile_duration).await?);
    }
    if let Some(path) = args.cpu_profile.as_deref() {
        drop(profile::start_cpu_profile(path, args.cpu_profile_duration).await?);
    }

    let mut disconnected = runner.disconnected();
    tokio::select! {
        () = shutdown::wait_for_signal() => {
            info!("Caught shutdown signal");
            events().publish(topics::QUIT, &Event::Quit);
        }
        _ = disconnected.changed() => {
            warn!("Master closed the connection");
        }
    }

    // Wait for the quit message to drain and the link to drop.
    while !*disconnected.borrow() {
        if disconnected.changed().await.is_err() {
            break;
        }
    }
    drop(shutdown_tx.send(()));
    info!("Shut down");
    Ok(())
}

/// Runs each task named in the comma-separated list once, skipping tasks
/// without a name. Used for local debugging via `--run-tasks`.
fn run_tasks_inline(requested: &str, tasks: &[Task]) -> AppResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let names: Vec<&str> = requested.split(',').map(str::trim).collect();
        for task in tasks {
            if task.name.is_empty() {
                continue;
            }
            if names.iter().any(|name| *name == task.name) {
                info!("Running {}", task.name);
                runner::safe_run(task).await;
            }
        }
    });
    Ok(())
}

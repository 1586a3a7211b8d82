use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::error::{AppError, AppResult};
use crate::shutdown::shutdown_channel;
use crate::stats::start_stats_collector;

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: std::future::Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(future)
}

fn sleepy_tasks() -> Vec<Task> {
    vec![
        Task::new("task_a", 10, || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }),
        Task::new("task_b", 20, || async {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }),
    ]
}

fn quick_tasks() -> Vec<Task> {
    vec![Task::new("quick", 1, || async {
        tokio::time::sleep(Duration::from_millis(10)).await;
    })]
}

fn new_runner(tasks: Vec<Task>, max_rps: i64, increase_rate: &str) -> AppResult<Runner> {
    let (shutdown_tx, _) = shutdown_channel();
    let stats = start_stats_collector(&shutdown_tx);
    let args = WorkerArgs {
        max_rps,
        request_increase_rate: increase_rate.to_owned(),
        ..WorkerArgs::default()
    };
    Runner::new(tasks, &args, stats)
}

async fn wait_until<C>(mut condition: C, timeout: Duration) -> bool
where
    C: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn expect_message(
    outbox: &mut mpsc::UnboundedReceiver<Envelope>,
    expected: &str,
) -> AppResult<MessageBody> {
    let envelope = tokio::time::timeout(Duration::from_secs(2), outbox.recv())
        .await
        .map_err(|_| AppError::config(format!("Timed out waiting for '{}'", expected)))?
        .ok_or_else(|| AppError::config("Outbox closed"))?;
    let tag = match &envelope.body {
        MessageBody::Hatch { .. } => "hatch",
        MessageBody::Stop => "stop",
        MessageBody::ClientReady => "client_ready",
        MessageBody::Hatching => "hatching",
        MessageBody::HatchComplete { .. } => "hatch_complete",
        MessageBody::ClientStopped => "client_stopped",
        MessageBody::Stats(_) => "stats",
        MessageBody::Quit => "quit",
    };
    if tag != expected {
        return Err(AppError::config(format!(
            "Expected '{}', got '{}'",
            expected, tag
        )));
    }
    Ok(envelope.body)
}

#[test]
fn new_runner_rejects_malformed_increase_rate() -> AppResult<()> {
    run_async_test(async {
        if new_runner(Vec::new(), 0, "every-so-often").is_ok() {
            return Err(AppError::config(
                "Expected a malformed increase rate to be fatal",
            ));
        }
        Ok(())
    })
}

#[test]
fn rps_control_enabled_only_with_ceiling() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(Vec::new(), 100, "100/2s")?;
        if runner.rps_controller().is_none() {
            return Err(AppError::config("Expected RPS control to be enabled"));
        }
        let runner = new_runner(Vec::new(), 0, "-1")?;
        if runner.rps_controller().is_some() {
            return Err(AppError::config("Expected RPS control to be disabled"));
        }
        Ok(())
    })
}

#[test]
fn spawning_reaches_target_count() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(sleepy_tasks(), 100, "-1")?;
        runner.ensure_stop_channel();
        runner.spawn_to_target(10, 10).await;
        if runner.num_clients() != 10 {
            return Err(AppError::config(format!(
                "Expected 10 workers, got {}",
                runner.num_clients()
            )));
        }
        runner.stop();
        Ok(())
    })
}

#[test]
fn hatch_then_quit_reports_upstream() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(sleepy_tasks(), 100, "-1")?;
        let mut outbox = runner
            .take_outbox()
            .ok_or_else(|| AppError::config("Outbox already taken"))?;

        runner.start_hatching(10, 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if runner.num_clients() != 10 {
            return Err(AppError::config(format!(
                "Expected 10 workers, got {}",
                runner.num_clients()
            )));
        }
        let body = expect_message(&mut outbox, "hatch_complete").await?;
        if body != (MessageBody::HatchComplete { count: 10 }) {
            return Err(AppError::config(format!("Unexpected payload: {:?}", body)));
        }

        runner.stop();
        runner.on_quitting();
        expect_message(&mut outbox, "quit").await?;
        if runner.state() != RunnerState::Quitting {
            return Err(AppError::config(format!(
                "Expected quitting state, got {:?}",
                runner.state()
            )));
        }
        Ok(())
    })
}

#[test]
fn master_messages_drive_the_state_machine() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(sleepy_tasks(), 100, "-1")?;
        let mut outbox = runner
            .take_outbox()
            .ok_or_else(|| AppError::config("Outbox already taken"))?;

        // First hatch: Init -> Hatching -> Running.
        runner
            .on_message(Envelope::new(
                MessageBody::Hatch {
                    hatch_rate: 10.0,
                    num_clients: 10,
                },
                "master",
            ))
            .await;
        expect_message(&mut outbox, "hatching").await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if runner.state() != RunnerState::Running {
            return Err(AppError::config(format!(
                "Expected running state, got {:?}",
                runner.state()
            )));
        }
        if runner.num_clients() != 10 {
            return Err(AppError::config(format!(
                "Expected 10 workers, got {}",
                runner.num_clients()
            )));
        }
        expect_message(&mut outbox, "hatch_complete").await?;

        // Re-hatch while running grows the pool.
        runner
            .on_message(Envelope::new(
                MessageBody::Hatch {
                    hatch_rate: 20.0,
                    num_clients: 20,
                },
                "master",
            ))
            .await;
        expect_message(&mut outbox, "hatching").await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if runner.num_clients() != 20 {
            return Err(AppError::config(format!(
                "Expected 20 workers, got {}",
                runner.num_clients()
            )));
        }
        expect_message(&mut outbox, "hatch_complete").await?;

        // Stop retires the pool and re-announces readiness.
        runner
            .on_message(Envelope::new(MessageBody::Stop, "master"))
            .await;
        if runner.state() != RunnerState::Stopped {
            return Err(AppError::config(format!(
                "Expected stopped state, got {:?}",
                runner.state()
            )));
        }
        expect_message(&mut outbox, "client_stopped").await?;
        expect_message(&mut outbox, "client_ready").await?;

        // A second stop in Stopped is a no-op.
        runner
            .on_message(Envelope::new(MessageBody::Stop, "master"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        match outbox.try_recv() {
            Err(mpsc::error::TryRecvError::Empty) => Ok(()),
            other => Err(AppError::config(format!(
                "Stop in Stopped should emit nothing, got {:?}",
                other
            ))),
        }
    })
}

#[test]
fn identical_hatches_settle_at_target() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(sleepy_tasks(), 0, "-1")?;
        runner.start_hatching(10, 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.start_hatching(10, 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if runner.num_clients() != 10 {
            return Err(AppError::config(format!(
                "Expected the pool to settle at 10, got {}",
                runner.num_clients()
            )));
        }
        runner.stop();
        Ok(())
    })
}

#[test]
fn rehatch_can_shrink_the_pool() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(quick_tasks(), 0, "-1")?;
        runner.start_hatching(10, 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if runner.num_clients() != 10 {
            return Err(AppError::config(format!(
                "Expected 10 workers before the shrink, got {}",
                runner.num_clients()
            )));
        }

        runner.start_hatching(3, 10);
        let drained = wait_until(|| runner.num_clients() == 3, Duration::from_secs(2)).await;
        if !drained {
            return Err(AppError::config(format!(
                "Pool did not shrink to 3, got {}",
                runner.num_clients()
            )));
        }
        runner.stop();
        Ok(())
    })
}

#[test]
fn stop_drains_all_workers() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(quick_tasks(), 0, "-1")?;
        runner.start_hatching(5, 5);
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.stop();
        let drained = wait_until(|| runner.num_clients() == 0, Duration::from_secs(2)).await;
        if !drained {
            return Err(AppError::config(format!(
                "Workers survived stop: {}",
                runner.num_clients()
            )));
        }
        if runner.state() != RunnerState::Stopped {
            return Err(AppError::config(format!(
                "Expected stopped state, got {:?}",
                runner.state()
            )));
        }
        Ok(())
    })
}

#[test]
fn safe_run_contains_panics() -> AppResult<()> {
    run_async_test(async {
        let task = Task::new("explosive", 1, || async {
            panic!("the task will be caught");
        });
        safe_run(&task).await;
        safe_run(&task).await;
        Ok(())
    })
}

#[test]
fn quit_from_init_is_valid() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(Vec::new(), 0, "-1")?;
        let mut outbox = runner
            .take_outbox()
            .ok_or_else(|| AppError::config("Outbox already taken"))?;
        runner.on_quitting();
        expect_message(&mut outbox, "quit").await?;
        if runner.state() != RunnerState::Quitting {
            return Err(AppError::config(format!(
                "Expected quitting state, got {:?}",
                runner.state()
            )));
        }

        // Idempotent: a second call emits nothing.
        runner.on_quitting();
        match outbox.try_recv() {
            Err(mpsc::error::TryRecvError::Empty) => Ok(()),
            other => Err(AppError::config(format!(
                "Second quit should emit nothing, got {:?}",
                other
            ))),
        }
    })
}

#[test]
fn messages_are_ignored_after_quitting() -> AppResult<()> {
    run_async_test(async {
        let runner = new_runner(sleepy_tasks(), 0, "-1")?;
        runner.on_quitting();
        runner
            .on_message(Envelope::new(
                MessageBody::Hatch {
                    hatch_rate: 10.0,
                    num_clients: 10,
                },
                "master",
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if runner.num_clients() != 0 {
            return Err(AppError::config(format!(
                "Hatch after quit should be ignored, got {} workers",
                runner.num_clients()
            )));
        }
        Ok(())
    })
}

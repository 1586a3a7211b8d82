//! The coordinator: translates master commands into worker lifecycles.
//!
//! The runner owns the pool of virtual users, the RPS governor, and the
//! reporting loop. Master messages drive a small state machine; spawning
//! and retiring workers is target-based, so repeated or overlapping
//! hatch commands converge on the most recent target.

mod rps;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::TryRecvError;
use futures_util::FutureExt;
use rand::Rng;
use rand::thread_rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::args::WorkerArgs;
use crate::client::MasterClient;
use crate::client::protocol::{Envelope, MessageBody};
use crate::error::AppResult;
use crate::events::{Event, events, topics};
use crate::limiter::RateLimiter;
use crate::stats::{StatsChannels, StatsInput, StatsPayload, StatsSnapshot};
use crate::task::{Task, weighted_plan};
use crate::util::build_node_id;

pub use rps::RpsController;

/// Pause between loop iterations when there is nothing to run.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);
/// Poll cadence while waiting for retired workers to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Hatching,
    Running,
    Stopped,
    Quitting,
}

impl RunnerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerState::Init => "ready",
            RunnerState::Hatching => "hatching",
            RunnerState::Running => "running",
            RunnerState::Stopped => "stopped",
            RunnerState::Quitting => "quitting",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunnerState::Hatching,
            2 => RunnerState::Running,
            3 => RunnerState::Stopped,
            4 => RunnerState::Quitting,
            _ => RunnerState::Init,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunnerState::Init => 0,
            RunnerState::Hatching => 1,
            RunnerState::Running => 2,
            RunnerState::Stopped => 3,
            RunnerState::Quitting => 4,
        }
    }
}

type StopChannel = (crossbeam_channel::Sender<()>, crossbeam_channel::Receiver<()>);

/// Cheaply cloneable handle; all state lives behind one shared allocation
/// so background loops can hold the runner across awaits.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    tasks: Vec<Task>,
    state: AtomicU8,
    num_clients: Arc<AtomicI64>,
    stop_channel: Mutex<Option<StopChannel>>,
    worker_shutdown_tx: broadcast::Sender<()>,
    spawner: Mutex<Option<JoinHandle<()>>>,
    rps: Option<Arc<RpsController>>,
    client: MasterClient,
    stats_input: mpsc::UnboundedSender<StatsInput>,
    snapshots: Mutex<Option<mpsc::UnboundedReceiver<StatsSnapshot>>>,
}

impl Runner {
    /// Builds a runner and resolves its RPS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the request increase rate is malformed.
    pub fn new(tasks: Vec<Task>, args: &WorkerArgs, stats: StatsChannels) -> AppResult<Self> {
        let node_id = build_node_id();
        let client = MasterClient::new(&args.master_host, args.master_port, node_id);

        let mut controller =
            RpsController::new(args.max_rps, &args.request_increase_rate, args.hatch_type);
        controller.parse_args()?;
        let rps = controller.enabled().then(|| Arc::new(controller));

        let (worker_shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            inner: Arc::new(RunnerInner {
                tasks,
                state: AtomicU8::new(RunnerState::Init.as_u8()),
                num_clients: Arc::new(AtomicI64::new(0)),
                stop_channel: Mutex::new(None),
                worker_shutdown_tx,
                spawner: Mutex::new(None),
                rps,
                client,
                stats_input: stats.input,
                snapshots: Mutex::new(Some(stats.snapshots)),
            }),
        })
    }

    #[must_use]
    pub fn state(&self) -> RunnerState {
        RunnerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: RunnerState) {
        self.inner.state.store(state.as_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn num_clients(&self) -> i64 {
        self.inner.num_clients.load(Ordering::SeqCst)
    }

    /// Watch that flips once the master link terminates.
    #[must_use]
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.inner.client.disconnected()
    }

    #[cfg(test)]
    pub(crate) fn rps_controller(&self) -> Option<&Arc<RpsController>> {
        self.inner.rps.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn take_outbox(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inner.client.take_outbox()
    }

    /// Connects to the master, wires domain events into the stats
    /// pipeline, starts the receive and report loops, and announces
    /// readiness.
    ///
    /// # Errors
    ///
    /// Returns an error if the master cannot be reached.
    pub async fn get_ready(&self) -> AppResult<()> {
        self.inner.client.connect().await?;

        let stats_input = self.inner.stats_input.clone();
        events().subscribe(topics::REQUEST_SUCCESS, move |event| {
            if let Event::RequestSuccess {
                method,
                name,
                response_time,
                content_length,
            } = event
            {
                drop(stats_input.send(StatsInput::Success {
                    method: method.clone(),
                    name: name.clone(),
                    response_time: *response_time,
                    content_length: *content_length,
                }));
            }
        });
        let stats_input = self.inner.stats_input.clone();
        events().subscribe(topics::REQUEST_FAILURE, move |event| {
            if let Event::RequestFailure {
                method,
                name,
                response_time,
                error,
            } = event
            {
                drop(stats_input.send(StatsInput::Failure {
                    method: method.clone(),
                    name: name.clone(),
                    response_time: *response_time,
                    error: error.clone(),
                }));
            }
        });
        let runner = self.clone();
        events().subscribe(topics::QUIT, move |_event| runner.on_quitting());

        if let Some(mut receiver) = self.inner.client.take_receiver() {
            let runner = self.clone();
            tokio::spawn(async move {
                while let Some(envelope) = receiver.recv().await {
                    runner.on_message(envelope).await;
                }
                debug!("Receive loop finished");
            });
        }

        self.inner.client.send(MessageBody::ClientReady);
        self.start_reporting();
        Ok(())
    }

    /// Forwards each stats window upstream, decorated with the live user
    /// count and state.
    fn start_reporting(&self) {
        let snapshots = match self.inner.snapshots.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut snapshots) = snapshots else {
            return;
        };
        let runner = self.clone();
        tokio::spawn(async move {
            while let Some(window) = snapshots.recv().await {
                let payload = StatsPayload {
                    stats: window.entries,
                    stats_total: window.total,
                    errors: window.errors,
                    user_count: runner.num_clients(),
                    state: runner.state().as_str().to_owned(),
                };
                runner
                    .inner
                    .client
                    .send(MessageBody::Stats(Box::new(payload)));
            }
            debug!("Report loop finished");
        });
    }

    /// Handles one inbound master message.
    pub async fn on_message(&self, envelope: Envelope) {
        if self.state() == RunnerState::Quitting {
            return;
        }
        match envelope.body {
            MessageBody::Hatch {
                hatch_rate,
                num_clients,
            } => {
                self.inner.client.send(MessageBody::Hatching);
                let rate = hatch_rate.max(1.0) as i64;
                self.start_hatching(num_clients, rate);
            }
            MessageBody::Stop => match self.state() {
                RunnerState::Hatching | RunnerState::Running => {
                    self.stop();
                    self.inner.client.send(MessageBody::ClientStopped);
                    self.inner.client.send(MessageBody::ClientReady);
                }
                _ => debug!("Ignoring stop in state {:?}", self.state()),
            },
            MessageBody::Quit => {
                info!("Got quit message from master");
                events().publish(topics::QUIT, &Event::Quit);
                self.on_quitting();
            }
            other => debug!("Ignoring unexpected message from master: {:?}", other),
        }
    }

    /// Moves the worker pool toward `spawn_count` at `hatch_rate` workers
    /// per second. Clears the stats window, restarts the RPS governor,
    /// and cancels any spawn still in flight from a previous command.
    pub fn start_hatching(&self, spawn_count: i64, hatch_rate: i64) {
        info!(
            "Hatching to {} workers at {} per second",
            spawn_count, hatch_rate
        );
        self.set_state(RunnerState::Hatching);
        drop(self.inner.stats_input.send(StatsInput::Clear));
        if let Some(rps) = &self.inner.rps {
            rps.stop();
            rps.start();
        }

        if let Ok(mut slot) = self.inner.spawner.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.ensure_stop_channel();

        let runner = self.clone();
        let handle = tokio::spawn(async move {
            runner.spawn_to_target(spawn_count, hatch_rate).await;
        });
        if let Ok(mut slot) = self.inner.spawner.lock() {
            *slot = Some(handle);
        }
    }

    async fn spawn_to_target(&self, target: i64, rate: i64) {
        let current = self.num_clients();
        if current > target {
            self.retire_workers(current - target);
            while self.num_clients() > target {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        } else {
            let plan = Arc::new(weighted_plan(&self.inner.tasks));
            loop {
                let remaining = target - self.num_clients();
                if remaining <= 0 {
                    break;
                }
                let batch = remaining.min(rate.max(1));
                for _ in 0..batch {
                    self.spawn_worker(Arc::clone(&plan));
                }
                if target - self.num_clients() <= 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        self.set_state(RunnerState::Running);
        let count = self.num_clients();
        info!("All {} workers hatched", count);
        self.inner
            .client
            .send(MessageBody::HatchComplete { count });
    }

    fn ensure_stop_channel(&self) {
        if let Ok(mut slot) = self.inner.stop_channel.lock() {
            if slot.is_none() {
                *slot = Some(crossbeam_channel::unbounded());
            }
        }
    }

    /// Signals `count` workers to exit at their next loop iteration.
    fn retire_workers(&self, count: i64) {
        debug!("Retiring {} workers", count);
        if let Ok(slot) = self.inner.stop_channel.lock() {
            if let Some((stop_tx, _)) = slot.as_ref() {
                for _ in 0..count {
                    drop(stop_tx.send(()));
                }
            }
        }
    }

    fn spawn_worker(&self, plan: Arc<Vec<Task>>) {
        let stop_rx = match self.inner.stop_channel.lock() {
            Ok(slot) => match slot.as_ref() {
                Some((_, stop_rx)) => stop_rx.clone(),
                None => return,
            },
            Err(_) => return,
        };
        let shutdown_rx = self.inner.worker_shutdown_tx.subscribe();
        let limiter = self
            .inner
            .rps
            .as_ref()
            .map(|rps| Arc::clone(rps) as Arc<dyn RateLimiter>);
        let num_clients = Arc::clone(&self.inner.num_clients);
        num_clients.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(worker_loop(plan, stop_rx, shutdown_rx, limiter, num_clients));
    }

    /// Signals every worker to terminate and halts the RPS governor.
    /// Emits nothing; callers decide what the master should hear.
    pub fn stop(&self) {
        info!("Stopping all workers");
        if let Ok(mut slot) = self.inner.spawner.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.inner.stop_channel.lock() {
            // Dropping the sender disconnects the channel; workers treat
            // that as a stop signal at their next iteration.
            slot.take();
        }
        drop(self.inner.worker_shutdown_tx.send(()));
        if let Some(rps) = &self.inner.rps {
            rps.stop();
        }
        self.set_state(RunnerState::Stopped);
    }

    /// Final transition: retire the pool and tell the master we are
    /// leaving. The process exits once the link drops.
    pub fn on_quitting(&self) {
        if self.state() == RunnerState::Quitting {
            return;
        }
        if let Ok(mut slot) = self.inner.spawner.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.inner.stop_channel.lock() {
            slot.take();
        }
        drop(self.inner.worker_shutdown_tx.send(()));
        if let Some(rps) = &self.inner.rps {
            rps.stop();
        }
        self.inner.client.send(MessageBody::Quit);
        self.set_state(RunnerState::Quitting);
    }
}

async fn worker_loop(
    plan: Arc<Vec<Task>>,
    stop_rx: crossbeam_channel::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    limiter: Option<Arc<dyn RateLimiter>>,
    num_clients: Arc<AtomicI64>,
) {
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        if let Some(limiter) = limiter.as_ref() {
            let acquired = tokio::select! {
                _ = limiter.acquire() => true,
                _ = shutdown_rx.recv() => false,
            };
            if !acquired {
                break;
            }
        }
        let Some(task) = pick_task(&plan) else {
            tokio::time::sleep(IDLE_BACKOFF).await;
            continue;
        };
        safe_run(&task).await;
    }
    num_clients.fetch_sub(1, Ordering::SeqCst);
}

fn pick_task(plan: &[Task]) -> Option<Task> {
    if plan.is_empty() {
        return None;
    }
    let index = thread_rng().gen_range(0..plan.len());
    plan.get(index).cloned()
}

/// Runs one task iteration, containing any panic it raises. A panicking
/// task is logged and the worker carries on with its next pick.
pub(crate) async fn safe_run(task: &Task) {
    let future = std::panic::AssertUnwindSafe((task.func)()).catch_unwind();
    if let Err(payload) = future.await {
        warn!(
            "Task '{}' panicked: {}",
            task.name,
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "opaque panic payload".to_owned()
}

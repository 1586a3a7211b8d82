use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::shutdown::ShutdownSender;

use super::types::{FailureKey, FailureSnapshot, StatsEntry, StatsSnapshot};

/// How often a snapshot is published to the runner.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(3);

const TOTAL_KEY: &str = "Total";

/// One sample or control signal flowing into the aggregator.
#[derive(Debug, Clone)]
pub enum StatsInput {
    Success {
        method: String,
        name: String,
        response_time: i64,
        content_length: i64,
    },
    Failure {
        method: String,
        name: String,
        response_time: i64,
        error: String,
    },
    Clear,
}

/// Channel ends handed to the runner: samples in, snapshots out.
pub struct StatsChannels {
    pub input: mpsc::UnboundedSender<StatsInput>,
    pub snapshots: mpsc::UnboundedReceiver<StatsSnapshot>,
    pub handle: JoinHandle<()>,
}

/// All live counters. Single-owner: only the collector task mutates it,
/// so the maps need no locks.
pub(super) struct StatsCollector {
    entries: HashMap<(String, String), StatsEntry>,
    errors: HashMap<FailureKey, i64>,
    total: StatsEntry,
}

impl StatsCollector {
    pub(super) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            errors: HashMap::new(),
            total: StatsEntry::new(TOTAL_KEY, TOTAL_KEY),
        }
    }

    fn entry(&mut self, method: &str, name: &str) -> &mut StatsEntry {
        self.entries
            .entry((method.to_owned(), name.to_owned()))
            .or_insert_with(|| StatsEntry::new(method, name))
    }

    fn on_success(&mut self, method: &str, name: &str, response_time: i64, content_length: i64) {
        self.entry(method, name).log(response_time, content_length);
        self.total.log(response_time, content_length);
    }

    fn on_failure(&mut self, method: &str, name: &str, _response_time: i64, error: String) {
        self.entry(method, name).log_failure();
        self.total.log_failure();
        let key = FailureKey {
            method: method.to_owned(),
            name: name.to_owned(),
            error,
        };
        *self.errors.entry(key).or_insert(0) += 1;
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.errors.clear();
        self.total.reset();
    }

    /// Builds the reporting window and resets per-window counters. The
    /// cumulative `Total` entry persists across windows.
    pub(super) fn take_window(&mut self) -> StatsSnapshot {
        let entries = self
            .entries
            .values()
            .map(StatsEntry::snapshot)
            .collect::<Vec<_>>();
        let errors = self
            .errors
            .iter()
            .map(|(key, occurrences)| FailureSnapshot {
                method: key.method.clone(),
                name: key.name.clone(),
                error: key.error.clone(),
                occurrences: *occurrences,
            })
            .collect::<Vec<_>>();
        let total = self.total.snapshot();
        self.entries.clear();
        self.errors.clear();
        StatsSnapshot {
            entries,
            total,
            errors,
        }
    }

    pub(super) fn apply(&mut self, input: StatsInput) {
        match input {
            StatsInput::Success {
                method,
                name,
                response_time,
                content_length,
            } => self.on_success(&method, &name, response_time, content_length),
            StatsInput::Failure {
                method,
                name,
                response_time,
                error,
            } => self.on_failure(&method, &name, response_time, error),
            StatsInput::Clear => self.clear(),
        }
    }
}

/// Spawns the aggregator task. It drains samples continuously and
/// publishes a snapshot every [`REPORT_INTERVAL`], resetting the
/// per-window counters after each publish.
#[must_use]
pub fn start_stats_collector(shutdown_tx: &ShutdownSender) -> StatsChannels {
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<StatsInput>();
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel::<StatsSnapshot>();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let handle = tokio::spawn(async move {
        let mut collector = StatsCollector::new();
        let mut report_interval = tokio::time::interval(REPORT_INTERVAL);
        report_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first window
        // spans a full interval.
        report_interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                maybe_input = input_rx.recv() => {
                    let input = match maybe_input {
                        Some(input) => input,
                        None => break,
                    };
                    collector.apply(input);
                },
                _ = report_interval.tick() => {
                    let window = collector.take_window();
                    if snapshot_tx.send(window).is_err() {
                        debug!("Snapshot receiver dropped; stopping stats collector");
                        break;
                    }
                },
            }
        }
    });

    StatsChannels {
        input: input_tx,
        snapshots: snapshot_rx,
        handle,
    }
}

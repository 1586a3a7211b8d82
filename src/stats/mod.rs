//! Aggregation pipeline for per-request samples.
//!
//! Producers (virtual users, via the event bus) push samples into a single
//! collector task; the collector folds them into per-(method, name)
//! entries plus a cumulative total, and publishes a snapshot of the
//! current window on a fixed cadence. The runner decorates each snapshot
//! with its user count and state before sending it upstream.

mod collector;
mod types;

pub use collector::{REPORT_INTERVAL, StatsChannels, StatsInput, start_stats_collector};
pub use types::{
    EntrySnapshot, FailureKey, FailureSnapshot, StatsEntry, StatsPayload, StatsSnapshot,
    round_response_time,
};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::util::current_time_secs;

/// Live per-key counters for one (method, name) pair. Response times are
/// milliseconds; the distribution buckets them to two significant digits
/// to stay compact under load.
#[derive(Debug, Clone)]
pub struct StatsEntry {
    pub name: String,
    pub method: String,
    pub num_requests: i64,
    pub num_failures: i64,
    pub total_response_time: i64,
    pub min_response_time: i64,
    pub max_response_time: i64,
    pub num_reqs_per_sec: HashMap<i64, i64>,
    pub response_times: HashMap<i64, i64>,
    pub total_content_length: i64,
    pub start_time: i64,
}

impl StatsEntry {
    #[must_use]
    pub fn new<M, N>(method: M, name: N) -> Self
    where
        M: Into<String>,
        N: Into<String>,
    {
        Self {
            name: name.into(),
            method: method.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: 0,
            max_response_time: 0,
            num_reqs_per_sec: HashMap::new(),
            response_times: HashMap::new(),
            total_content_length: 0,
            start_time: current_time_secs(),
        }
    }

    pub fn reset(&mut self) {
        self.num_requests = 0;
        self.num_failures = 0;
        self.total_response_time = 0;
        self.min_response_time = 0;
        self.max_response_time = 0;
        self.num_reqs_per_sec.clear();
        self.response_times.clear();
        self.total_content_length = 0;
        self.start_time = current_time_secs();
    }

    pub fn log(&mut self, response_time: i64, content_length: i64) {
        self.num_requests = self.num_requests.saturating_add(1);
        self.log_time_of_request();
        self.log_response_time(response_time);
        self.total_content_length = self.total_content_length.saturating_add(content_length);
    }

    pub fn log_failure(&mut self) {
        self.num_failures = self.num_failures.saturating_add(1);
    }

    fn log_time_of_request(&mut self) {
        let key = current_time_secs();
        *self.num_reqs_per_sec.entry(key).or_insert(0) += 1;
    }

    fn log_response_time(&mut self, response_time: i64) {
        self.total_response_time = self.total_response_time.saturating_add(response_time);
        if self.num_requests <= 1 || response_time < self.min_response_time {
            self.min_response_time = response_time;
        }
        if response_time > self.max_response_time {
            self.max_response_time = response_time;
        }
        let rounded = round_response_time(response_time);
        *self.response_times.entry(rounded).or_insert(0) += 1;
    }

    /// Value at the given quantile of the bucketed distribution, e.g.
    /// `percentile(0.95)`. Falls back to the observed maximum when the
    /// cumulative walk never reaches the target count.
    #[must_use]
    pub fn percentile(&self, quantile: f64) -> i64 {
        if self.num_requests == 0 {
            return 0;
        }
        let threshold = (self.num_requests as f64 * quantile).ceil() as i64;
        let mut keys: Vec<i64> = self.response_times.keys().copied().collect();
        keys.sort_unstable();
        let mut cumulative = 0i64;
        for key in keys {
            cumulative =
                cumulative.saturating_add(self.response_times.get(&key).copied().unwrap_or(0));
            if cumulative >= threshold {
                return key;
            }
        }
        self.max_response_time
    }

    #[must_use]
    pub fn median_response_time(&self) -> i64 {
        self.percentile(0.5)
    }

    #[must_use]
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            name: self.name.clone(),
            method: self.method.clone(),
            num_requests: self.num_requests,
            num_failures: self.num_failures,
            total_response_time: self.total_response_time,
            min_response_time: self.min_response_time,
            max_response_time: self.max_response_time,
            median_response_time: self.median_response_time(),
            p95_response_time: self.percentile(0.95),
            p99_response_time: self.percentile(0.99),
            total_content_length: self.total_content_length,
            start_time: self.start_time,
            num_reqs_per_sec: stringify_keys(&self.num_reqs_per_sec),
            response_times: stringify_keys(&self.response_times),
        }
    }
}

/// Rounds a response time to two significant digits, e.g. 154 -> 150,
/// 3_432 -> 3_400. Values under 100 are kept exact.
#[must_use]
pub fn round_response_time(response_time: i64) -> i64 {
    if response_time < 100 {
        return response_time;
    }
    let mut magnitude = 1i64;
    let mut value = response_time;
    while value >= 100 {
        value /= 10;
        magnitude = magnitude.saturating_mul(10);
    }
    response_time
        .saturating_add(magnitude / 2)
        .checked_div(magnitude)
        .unwrap_or(0)
        .saturating_mul(magnitude)
}

/// JSON object keys must be strings, so the bucket maps are keyed by the
/// decimal rendering of the second / rounded response time.
fn stringify_keys(buckets: &HashMap<i64, i64>) -> HashMap<String, i64> {
    buckets
        .iter()
        .map(|(key, count)| (key.to_string(), *count))
        .collect()
}

/// Point-in-time copy of one entry, as reported upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntrySnapshot {
    pub name: String,
    pub method: String,
    pub num_requests: i64,
    pub num_failures: i64,
    pub total_response_time: i64,
    pub min_response_time: i64,
    pub max_response_time: i64,
    pub median_response_time: i64,
    pub p95_response_time: i64,
    pub p99_response_time: i64,
    pub total_content_length: i64,
    pub start_time: i64,
    pub num_reqs_per_sec: HashMap<String, i64>,
    pub response_times: HashMap<String, i64>,
}

/// Key of the failures table: one row per distinct (method, name, error).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FailureKey {
    pub method: String,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureSnapshot {
    pub method: String,
    pub name: String,
    pub error: String,
    pub occurrences: i64,
}

/// One reporting window, as published to the runner every tick.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub entries: Vec<EntrySnapshot>,
    pub total: EntrySnapshot,
    pub errors: Vec<FailureSnapshot>,
}

/// Body of the `stats` message sent upstream: the snapshot plus the
/// runner's view of itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsPayload {
    pub stats: Vec<EntrySnapshot>,
    pub stats_total: EntrySnapshot,
    pub errors: Vec<FailureSnapshot>,
    pub user_count: i64,
    pub state: String,
}

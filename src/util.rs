use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn current_time_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

/// Whole seconds since the Unix epoch, used to key per-second request buckets.
pub(crate) fn current_time_secs() -> i64 {
    i64::try_from(current_time_ms() / 1000).unwrap_or(i64::MAX)
}

pub(crate) fn build_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_owned());
    format!("{}_{}_{}", host, std::process::id(), current_time_ms())
}

//! Lightweight profiling hooks: background tasks that sample process
//! memory (RSS) or CPU time from `/proc/self` on a fixed cadence and
//! append the samples to a file for the configured duration.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::util::current_time_ms;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Samples resident-set size into `path` for `duration`.
///
/// # Errors
///
/// Returns an error if the output file cannot be created.
pub async fn start_memory_profile(path: &str, duration: Duration) -> AppResult<JoinHandle<()>> {
    let mut file = tokio::fs::File::create(path).await?;
    let label = path.to_owned();
    Ok(tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                _ = interval.tick() => {
                    let Some(rss_bytes) = read_rss_bytes() else {
                        warn!("Memory sampling unavailable on this platform");
                        break;
                    };
                    let line = format!("{} rss_bytes={}\n", current_time_ms(), rss_bytes);
                    if let Err(err) = file.write_all(line.as_bytes()).await {
                        warn!("Failed to write memory sample: {}", err);
                        break;
                    }
                }
            }
        }
        drop(file.flush().await);
        info!("Stopped memory profiling into {} after {:?}", label, duration);
    }))
}

/// Samples cumulative CPU time into `path` for `duration`.
///
/// # Errors
///
/// Returns an error if the output file cannot be created.
pub async fn start_cpu_profile(path: &str, duration: Duration) -> AppResult<JoinHandle<()>> {
    let mut file = tokio::fs::File::create(path).await?;
    let label = path.to_owned();
    Ok(tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                _ = interval.tick() => {
                    let Some((utime, stime)) = read_cpu_ticks() else {
                        warn!("CPU sampling unavailable on this platform");
                        break;
                    };
                    let line = format!("{} utime={} stime={}\n", current_time_ms(), utime, stime);
                    if let Err(err) = file.write_all(line.as_bytes()).await {
                        warn!("Failed to write CPU sample: {}", err);
                        break;
                    }
                }
            }
        }
        drop(file.flush().await);
        info!("Stopped CPU profiling into {} after {:?}", label, duration);
    }))
}

fn read_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let mut parts = statm.split_whitespace();
        let _size = parts.next()?;
        let resident = parts.next()?.parse::<u64>().ok()?;
        // Safety: sysconf is safe to call; we only read the page size.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        let page_size = u64::try_from(page_size).ok()?;
        Some(resident.saturating_mul(page_size))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

fn read_cpu_ticks() -> Option<(u64, u64)> {
    #[cfg(target_os = "linux")]
    {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // Fields after the parenthesized command name; utime and stime are
        // the 14th and 15th fields of the full line.
        let rest = stat.rsplit_once(')').map(|(_, rest)| rest)?;
        let mut fields = rest.split_whitespace();
        let utime = fields.nth(11)?.parse::<u64>().ok()?;
        let stime = fields.next()?.parse::<u64>().ok()?;
        Some((utime, stime))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};

    fn run_async_test<F>(future: F) -> AppResult<()>
    where
        F: std::future::Future<Output = AppResult<()>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(future)
    }

    #[test]
    fn memory_profile_writes_samples() -> AppResult<()> {
        run_async_test(async {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join("mem.profile");
            let path = path
                .to_str()
                .ok_or_else(|| AppError::config("Non-UTF-8 temp path"))?
                .to_owned();

            let handle = start_memory_profile(&path, Duration::from_millis(50)).await?;
            handle.await?;

            let contents = std::fs::read_to_string(&path)?;
            if cfg!(target_os = "linux") && !contents.contains("rss_bytes=") {
                return Err(AppError::config(format!(
                    "Expected RSS samples, got: {:?}",
                    contents
                )));
            }
            Ok(())
        })
    }

    #[test]
    fn cpu_profile_creates_output() -> AppResult<()> {
        run_async_test(async {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join("cpu.profile");
            let path = path
                .to_str()
                .ok_or_else(|| AppError::config("Non-UTF-8 temp path"))?
                .to_owned();

            let handle = start_cpu_profile(&path, Duration::from_millis(50)).await?;
            handle.await?;
            if !std::path::Path::new(&path).exists() {
                return Err(AppError::config("Profile output file missing"));
            }
            Ok(())
        })
    }
}

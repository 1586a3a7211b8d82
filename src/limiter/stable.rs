use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use super::RateLimiter;

/// Token bucket refilled to a fixed threshold every period.
#[derive(Clone)]
pub struct StableRateLimiter {
    shared: Arc<Shared>,
}

struct Shared {
    threshold: i64,
    refill_period: Duration,
    current_threshold: AtomicI64,
    refill_tx: broadcast::Sender<()>,
    quit_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl StableRateLimiter {
    #[must_use]
    pub fn new(threshold: i64, refill_period: Duration) -> Self {
        let (refill_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                threshold,
                refill_period,
                current_threshold: AtomicI64::new(threshold),
                refill_tx,
                quit_tx: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> i64 {
        self.shared.threshold
    }

    #[must_use]
    pub fn current_threshold(&self) -> i64 {
        self.shared.current_threshold.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateLimiter for StableRateLimiter {
    fn start(&self) {
        let (quit_tx, mut quit_rx) = watch::channel(false);
        if let Ok(mut slot) = self.shared.quit_tx.lock() {
            *slot = Some(quit_tx);
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                shared
                    .current_threshold
                    .store(shared.threshold, Ordering::SeqCst);
                tokio::select! {
                    () = tokio::time::sleep(shared.refill_period) => {}
                    _ = quit_rx.changed() => break,
                }
                drop(shared.refill_tx.send(()));
            }
            // Release anyone parked at stop time.
            drop(shared.refill_tx.send(()));
        });
    }

    async fn acquire(&self) -> bool {
        let permit = self
            .shared
            .current_threshold
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        if permit >= 0 {
            return false;
        }
        // Park until the refill task broadcasts; a lagged receiver still
        // counts as a wake-up.
        let mut refill_rx = self.shared.refill_tx.subscribe();
        drop(refill_rx.recv().await);
        true
    }

    fn stop(&self) {
        let quit_tx = match self.shared.quit_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(quit_tx) = quit_tx {
            drop(quit_tx.send(true));
        }
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
    fn acquires_within_threshold_do_not_block() -> AppResult<()> {
        run_async_test(async {
            let limiter = StableRateLimiter::new(3, Duration::from_secs(10));
            limiter.start();
            for _ in 0..3 {
                let blocked =
                    tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
                        .await
                        .map_err(|_| AppError::config("Acquire should not block"))?;
                if blocked {
                    return Err(AppError::config("Acquire within threshold reported blocked"));
                }
            }
            limiter.stop();
            Ok(())
        })
    }

    #[test]
    fn depleted_bucket_blocks_until_refill() -> AppResult<()> {
        run_async_test(async {
            let limiter = StableRateLimiter::new(1, Duration::from_millis(50));
            limiter.start();
            let _ = limiter.acquire().await;

            let started = tokio::time::Instant::now();
            let blocked = tokio::time::timeout(Duration::from_secs(1), limiter.acquire())
                .await
                .map_err(|_| AppError::config("Refill never woke the acquirer"))?;
            if !blocked {
                return Err(AppError::config("Depleted acquire should report blocked"));
            }
            if started.elapsed() < Duration::from_millis(20) {
                return Err(AppError::config("Acquire returned before the refill"));
            }
            limiter.stop();
            Ok(())
        })
    }

    #[test]
    fn refill_wakes_all_blocked_acquirers() -> AppResult<()> {
        run_async_test(async {
            let limiter = StableRateLimiter::new(1, Duration::from_millis(50));
            limiter.start();
            let _ = limiter.acquire().await;

            let mut handles = Vec::new();
            for _ in 0..4 {
                let limiter = limiter.clone();
                handles.push(tokio::spawn(async move { limiter.acquire().await }));
            }
            for handle in handles {
                let blocked = tokio::time::timeout(Duration::from_secs(1), handle)
                    .await
                    .map_err(|_| AppError::config("A blocked acquirer was never woken"))??;
                if !blocked {
                    return Err(AppError::config("Blocked acquirer reported non-blocked"));
                }
            }
            limiter.stop();
            Ok(())
        })
    }

    #[test]
    fn stop_releases_blocked_acquirers() -> AppResult<()> {
        run_async_test(async {
            let limiter = StableRateLimiter::new(1, Duration::from_secs(60));
            limiter.start();
            let _ = limiter.acquire().await;

            let blocked_limiter = limiter.clone();
            let handle = tokio::spawn(async move { blocked_limiter.acquire().await });
            tokio::time::sleep(Duration::from_millis(20)).await;
            limiter.stop();

            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .map_err(|_| AppError::config("Stop left an acquirer parked"))??;
            Ok(())
        })
    }
}

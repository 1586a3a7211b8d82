use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::args::parse_rate_spec;
use crate::error::ConfigError;

use super::RateLimiter;

/// Token bucket whose ceiling rises linearly until it reaches a maximum.
///
/// A second background task raises `next_threshold` by `warm_up_step`
/// every `warm_up_period`; each refill copies the risen ceiling into the
/// live permit counter. The ramp starts from zero, so traffic builds up
/// instead of bursting at full rate.
#[derive(Clone)]
pub struct WarmUpRateLimiter {
    shared: Arc<Shared>,
}

struct Shared {
    max_threshold: i64,
    refill_period: Duration,
    warm_up_step: i64,
    warm_up_period: Duration,
    next_threshold: AtomicI64,
    current_threshold: AtomicI64,
    refill_tx: broadcast::Sender<()>,
    quit_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl WarmUpRateLimiter {
    /// Builds a warm-up limiter from a ramp spec (`"N"` or `"N/D"`).
    ///
    /// # Errors
    ///
    /// Returns an error if the ramp spec cannot be parsed.
    pub fn new(
        max_threshold: i64,
        warm_up_rate: &str,
        refill_period: Duration,
    ) -> Result<Self, ConfigError> {
        let (warm_up_step, warm_up_period) = parse_rate_spec(warm_up_rate)?;
        Ok(Self::with_step(
            max_threshold,
            warm_up_step,
            warm_up_period,
            refill_period,
        ))
    }

    /// Builds a warm-up limiter from already-resolved ramp parameters.
    #[must_use]
    pub fn with_step(
        max_threshold: i64,
        warm_up_step: i64,
        warm_up_period: Duration,
        refill_period: Duration,
    ) -> Self {
        let (refill_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                max_threshold,
                refill_period,
                warm_up_step,
                warm_up_period,
                next_threshold: AtomicI64::new(0),
                current_threshold: AtomicI64::new(0),
                refill_tx,
                quit_tx: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn current_threshold(&self) -> i64 {
        self.shared.current_threshold.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn next_threshold(&self) -> i64 {
        self.shared.next_threshold.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateLimiter for WarmUpRateLimiter {
    fn start(&self) {
        let (quit_tx, quit_rx) = watch::channel(false);
        if let Ok(mut slot) = self.shared.quit_tx.lock() {
            *slot = Some(quit_tx);
        }

        // Bucket updater: copy the risen ceiling into the permit counter
        // each period and wake parked acquirers.
        let shared = Arc::clone(&self.shared);
        let mut bucket_quit_rx = quit_rx.clone();
        tokio::spawn(async move {
            loop {
                let next = shared.next_threshold.load(Ordering::SeqCst);
                shared.current_threshold.store(next, Ordering::SeqCst);
                tokio::select! {
                    () = tokio::time::sleep(shared.refill_period) => {}
                    _ = bucket_quit_rx.changed() => break,
                }
                drop(shared.refill_tx.send(()));
            }
            // Release anyone parked at stop time.
            drop(shared.refill_tx.send(()));
        });

        // Threshold updater: linear ramp, saturating at the maximum.
        let shared = Arc::clone(&self.shared);
        let mut ramp_quit_rx = quit_rx;
        tokio::spawn(async move {
            loop {
                let risen = shared
                    .next_threshold
                    .load(Ordering::SeqCst)
                    .saturating_add(shared.warm_up_step)
                    .clamp(0, shared.max_threshold);
                shared.next_threshold.store(risen, Ordering::SeqCst);
                tokio::select! {
                    () = tokio::time::sleep(shared.warm_up_period) => {}
                    _ = ramp_quit_rx.changed() => break,
                }
            }
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
        let mut refill_rx = self.shared.refill_tx.subscribe();
        drop(refill_rx.recv().await);
        true
    }

    fn stop(&self) {
        // Reset both counters so a restart warms up from zero instead of
        // resuming the climbed ceiling.
        self.shared.next_threshold.store(0, Ordering::SeqCst);
        self.shared.current_threshold.store(0, Ordering::SeqCst);
        let quit_tx = match self.shared.quit_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(quit_tx) = quit_tx {
            drop(quit_tx.send(true));
        }
    }
}

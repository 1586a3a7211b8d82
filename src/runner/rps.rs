use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::args::{HatchType, parse_rate_spec};
use crate::error::ConfigError;
use crate::limiter::{RateLimiter, StableRateLimiter, WarmUpRateLimiter};

/// Disables the warm-up ramp; the ceiling jumps straight to the maximum.
const RAMP_DISABLED: &str = "-1";

/// Global requests-per-second governor for the worker.
///
/// The controller owns one limiter from the family and restarts it on
/// each hatch: a stable bucket when no ramp is configured, a warm-up
/// bucket when `increase_rate` asks for one. With `HatchType::Smooth`
/// the ceiling and ramp are scaled to tenths released every 100ms,
/// spreading tokens across the second instead of bursting at its start.
pub struct RpsController {
    max_rps: i64,
    hatch_type: HatchType,
    pub(crate) increase_rate: String,
    enabled: bool,
    step: i64,
    interval: Duration,
    governor: Governor,
}

enum Governor {
    Stable(StableRateLimiter),
    WarmUp(WarmUpRateLimiter),
}

impl Governor {
    fn as_limiter(&self) -> &dyn RateLimiter {
        match self {
            Governor::Stable(limiter) => limiter,
            Governor::WarmUp(limiter) => limiter,
        }
    }
}

impl RpsController {
    #[must_use]
    pub fn new(max_rps: i64, increase_rate: &str, hatch_type: HatchType) -> Self {
        Self {
            max_rps,
            hatch_type,
            increase_rate: increase_rate.to_owned(),
            enabled: false,
            step: 0,
            interval: Duration::from_secs(1),
            governor: Governor::Stable(StableRateLimiter::new(max_rps, Duration::from_secs(1))),
        }
    }

    /// Resolves the ramp spec into a step and interval, decides whether
    /// RPS control is active at all, and rebuilds the underlying limiter
    /// to match.
    ///
    /// # Errors
    ///
    /// Returns an error if the ramp spec is malformed.
    pub fn parse_args(&mut self) -> Result<(), ConfigError> {
        self.enabled = self.max_rps > 0;
        let (refill_period, scale) = match self.hatch_type {
            HatchType::Asap => (Duration::from_secs(1), 1),
            HatchType::Smooth => (Duration::from_millis(100), 10),
        };
        if self.increase_rate == RAMP_DISABLED {
            self.step = 0;
            self.interval = Duration::from_secs(1);
            self.governor =
                Governor::Stable(StableRateLimiter::new(self.max_rps / scale, refill_period));
            return Ok(());
        }
        let (step, interval) = parse_rate_spec(&self.increase_rate)?;
        info!(
            "Request increase step {} per {:?} up to {} rps",
            step, interval, self.max_rps
        );
        self.step = step;
        self.interval = interval;
        self.governor = Governor::WarmUp(WarmUpRateLimiter::with_step(
            self.max_rps / scale,
            step / scale,
            interval,
            refill_period,
        ));
        Ok(())
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn step(&self) -> i64 {
        self.step
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The per-refill ceiling the bucket is (being) raised to.
    #[must_use]
    pub fn rps_threshold(&self) -> i64 {
        match &self.governor {
            Governor::Stable(limiter) => limiter.threshold(),
            Governor::WarmUp(limiter) => limiter.next_threshold(),
        }
    }

    /// The live permit counter workers decrement.
    #[must_use]
    pub fn current_rps_threshold(&self) -> i64 {
        match &self.governor {
            Governor::Stable(limiter) => limiter.current_threshold(),
            Governor::WarmUp(limiter) => limiter.current_threshold(),
        }
    }
}

#[async_trait]
impl RateLimiter for RpsController {
    fn start(&self) {
        self.governor.as_limiter().start();
    }

    async fn acquire(&self) -> bool {
        self.governor.as_limiter().acquire().await
    }

    fn stop(&self) {
        self.governor.as_limiter().stop();
    }
}

//! Token-bucket rate limiters shared by every virtual user.
//!
//! Both variants keep a signed permit counter that acquirers decrement
//! atomically. A background refill task restores the counter on a fixed
//! period and broadcasts a wake-up; callers that drove the counter
//! negative park on the broadcast until the next refill. No burst is
//! carried over between periods.

mod stable;
mod warmup;

use async_trait::async_trait;

pub use stable::StableRateLimiter;
pub use warmup::WarmUpRateLimiter;

/// Common capability of the limiter family.
///
/// `acquire` returns `true` when the caller had to block for a refill,
/// `false` when a token was immediately available. After `stop`, one
/// final wake-up is broadcast so no acquirer is left parked forever.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn start(&self);
    async fn acquire(&self) -> bool;
    fn stop(&self);
}

//! Serialized gates with a post-release delay.
//!
//! Two process-wide instances throttle the whole fleet: one in front of
//! login attempts, one in front of gift accepts. The gate serves strictly
//! one caller at a time and re-opens only once the configured delay has
//! elapsed since acquire-success, regardless of how quickly the caller
//! finished its work.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Duration, Instant, sleep_until};

/// A gate serving one caller at a time with a post-release delay.
///
/// Cancelling a pending [`acquire`](GateLimiter::acquire) (dropping the
/// future) leaves the gate untouched. The limiter cannot fail, only delay.
#[derive(Clone)]
pub struct GateLimiter {
    delay: Duration,
    gate: Arc<Mutex<()>>,
}

impl GateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for the gate and pass through it.
    ///
    /// The returned [`GatePass`] keeps the gate closed; on drop it re-opens
    /// once `delay` has elapsed since this call resolved (immediately, when
    /// the caller already held it longer than that).
    pub async fn acquire(&self) -> GatePass {
        let guard = Arc::clone(&self.gate).lock_owned().await;
        GatePass {
            reopen_at: Instant::now() + self.delay,
            guard: Some(guard),
        }
    }
}

/// Proof of passage through a [`GateLimiter`].
pub struct GatePass {
    reopen_at: Instant,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GatePass {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let reopen_at = self.reopen_at;
            tokio::spawn(async move {
                sleep_until(reopen_at).await;
                drop(guard);
            });
        }
    }
}

//! Process-wide admission control for AWS calls
//!
//! Every SDK request made by the deployer is admitted through one shared
//! [`RateLimiter`]. A call admitted while `n` entries are still counted is
//! delayed by `floor(n / limit) * interval` and stays counted until one full
//! interval after it started, so no window ever runs more than `limit` calls.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    /// The limiter was torn down while the call was queued or running
    #[error("call aborted by rate limiter shutdown")]
    Aborted,
}

struct State {
    limit: usize,
    interval: Duration,
    /// Instants at which admitted calls stop counting against the window
    expiries: Vec<Instant>,
    cancel: CancellationToken,
}

impl State {
    fn prune(&mut self, now: Instant) {
        self.expiries.retain(|expiry| *expiry > now);
    }
}

/// Shared requests-per-interval limiter
pub struct RateLimiter {
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(limit: usize, interval: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                limit: limit.max(1),
                interval,
                expiries: Vec::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Reconfigure the limiter. Calls already admitted keep their delay.
    pub fn set_rate(&self, limit: usize, interval: Duration) {
        let mut state = self.lock();
        state.limit = limit.max(1);
        state.interval = interval;
        debug!(limit, interval_ms = interval.as_millis(), "Rate limit updated");
    }

    /// Number of admitted calls still counted against the current window
    pub fn in_flight(&self) -> usize {
        let mut state = self.lock();
        state.prune(Instant::now());
        state.expiries.len()
    }

    /// Reject every queued or running call with [`ThrottleError::Aborted`].
    ///
    /// Calls admitted afterwards run normally.
    pub fn abort(&self) {
        let mut state = self.lock();
        let pending = state.expiries.len();
        state.expiries.clear();
        let cancel = std::mem::replace(&mut state.cancel, CancellationToken::new());
        cancel.cancel();
        warn!(pending, "Rate limiter aborted");
    }

    /// Admit `f` under the rate limit and run it.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, ThrottleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (delay, cancel) = {
            let now = Instant::now();
            let mut state = self.lock();
            state.prune(now);
            let windows = (state.expiries.len() / state.limit) as u32;
            let delay = state.interval * windows;
            let expiry = now + delay + state.interval;
            state.expiries.push(expiry);
            (delay, state.cancel.clone())
        };

        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis(), "Call delayed by rate limit");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ThrottleError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ThrottleError::Aborted),
            out = f() => Ok(out),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // State is only touched in non-panicking sections, recover if poisoned
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RateLimiter")
            .field("limit", &state.limit)
            .field("interval", &state.interval)
            .field("in_flight", &state.expiries.len())
            .finish()
    }
}

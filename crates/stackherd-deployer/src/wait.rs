//! Waiting on slow resource transitions with exponential backoff.
//!
//! Stack and change-set status use the fixed-interval [`crate::poller`].
//! This is for the handful of deletions that have to wait on another
//! service first, such as a CloudFront distribution finishing its disable.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::Instant;
use tracing::debug;

/// Delay growth and deadline for [`settle`].
#[derive(Debug, Clone, Copy)]
pub struct Settle {
    pub first_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Duration,
}

impl Settle {
    /// A disabled distribution has to reach every edge location before it
    /// can be deleted, which routinely takes tens of minutes.
    pub const DISTRIBUTION: Settle = Settle {
        first_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(30),
        deadline: Duration::from_secs(45 * 60),
    };
}

/// Call `probe` until it reports the resource settled.
///
/// `Ok(false)` sleeps for the next backoff delay and probes again. Probe
/// errors end the wait. Running past the deadline is an error naming
/// `what`.
pub async fn settle<F, Fut>(what: &str, backoff: Settle, probe: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let give_up = Instant::now() + backoff.deadline;
    let mut delays = ExponentialBuilder::default()
        .with_min_delay(backoff.first_delay)
        .with_max_delay(backoff.max_delay)
        .with_jitter()
        .without_max_times()
        .build();

    let mut probes = 0u32;
    loop {
        probes += 1;
        if probe().await? {
            debug!(resource = %what, probes, "Settled");
            return Ok(());
        }
        let delay = delays.next().unwrap_or(backoff.max_delay);
        if Instant::now() + delay > give_up {
            bail!(
                "{what} did not settle within {:?} ({probes} probes)",
                backoff.deadline
            );
        }
        debug!(resource = %what, probes, delay_ms = delay.as_millis(), "Not settled yet");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const QUICK: Settle = Settle {
        first_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        deadline: Duration::from_secs(5),
    };

    #[tokio::test(start_paused = true)]
    async fn test_settles_after_retries() {
        let probes = AtomicU32::new(0);
        settle("distribution E1", QUICK, || {
            let n = probes.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 3) }
        })
        .await
        .unwrap();
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let err = settle("distribution E1", QUICK, || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("distribution E1 did not settle"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_ends_wait() {
        let err = settle("distribution E1", QUICK, || async {
            Err(anyhow::anyhow!("access denied"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "access denied");
    }
}

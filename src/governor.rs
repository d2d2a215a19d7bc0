//! Account-wide backoff for throttling signals from the source.
//!
//! The source limits requests per account, not per channel, so a single
//! [`RateGovernor`] is shared by every concurrent channel harvest. When any
//! request is throttled, [`RateGovernor::suspend`] moves the shared resume
//! instant forward; every caller of [`RateGovernor::ready`] then waits until
//! that instant before issuing its next request.
//!
//! ```text
//!  channel A ──fetch──▶ 429 (wait 30s) ──suspend──┐
//!  channel B ──fetch──▶ ok ──ready()──────────────┤ all block until t+30s
//!  channel C ──ready()────────────────────────────┘
//! ```
//!
//! Waiting happens only in [`ready`](RateGovernor::ready), which the harvester
//! calls before starting a request, so a message is never cut in half.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::HarvestError;

#[derive(Debug, Default)]
pub struct RateGovernor {
    resume_at: Mutex<Option<Instant>>,
    throttle_count: AtomicU64,
    waited_ms: AtomicU64,
}

/// Counters for the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GovernorStats {
    pub throttles: u64,
    pub waited: Duration,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a throttling signal; pause all requests for at least `wait`.
    ///
    /// Overlapping signals extend the pause to the latest deadline, never
    /// shorten it.
    pub fn suspend(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut resume_at = self.resume_at.lock().unwrap_or_else(|e| e.into_inner());
        let extended = match *resume_at {
            Some(current) if current >= until => false,
            _ => {
                *resume_at = Some(until);
                true
            }
        };
        drop(resume_at);

        self.throttle_count.fetch_add(1, Ordering::Relaxed);
        if extended {
            warn!(wait_secs = wait.as_secs_f64(), "source throttled, pausing all requests");
        }
    }

    /// Time left until requests may resume, if a pause is active.
    pub fn remaining(&self) -> Option<Duration> {
        let resume_at = *self.resume_at.lock().unwrap_or_else(|e| e.into_inner());
        resume_at.and_then(|t| {
            let now = Instant::now();
            (t > now).then(|| t - now)
        })
    }

    /// Wait until no pause is active. Returns early with
    /// [`HarvestError::Cancelled`] if `cancel` fires while waiting.
    pub async fn ready(&self, cancel: &CancellationToken) -> Result<(), HarvestError> {
        loop {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            let Some(wait) = self.remaining() else {
                return Ok(());
            };

            let started = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(HarvestError::Cancelled),
            }
            self.waited_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            // A later signal may have pushed the deadline out while we slept.
        }
    }

    pub fn stats(&self) -> GovernorStats {
        let stats = GovernorStats {
            throttles: self.throttle_count.load(Ordering::Relaxed),
            waited: Duration::from_millis(self.waited_ms.load(Ordering::Relaxed)),
        };
        if stats.throttles > 0 {
            info!(
                throttles = stats.throttles,
                waited_secs = stats.waited.as_secs_f64(),
                "rate governor summary"
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn ready_without_pause_returns_immediately() {
        let governor = RateGovernor::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        governor.ready(&cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(governor.stats().throttles, 0);
    }

    #[tokio::test]
    async fn ready_waits_at_least_the_pause() {
        let governor = RateGovernor::new();
        let cancel = CancellationToken::new();
        governor.suspend(Duration::from_millis(120));
        let start = Instant::now();
        governor.ready(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(governor.stats().throttles, 1);
        assert!(governor.remaining().is_none());
    }

    #[tokio::test]
    async fn shorter_signal_does_not_shorten_pause() {
        let governor = RateGovernor::new();
        governor.suspend(Duration::from_millis(200));
        governor.suspend(Duration::from_millis(10));
        let remaining = governor.remaining().unwrap();
        assert!(remaining > Duration::from_millis(100));
        assert_eq!(governor.stats().throttles, 2);
    }

    #[tokio::test]
    async fn pause_is_shared_between_tasks() {
        let governor = Arc::new(RateGovernor::new());
        let cancel = CancellationToken::new();
        governor.suspend(Duration::from_millis(100));

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let governor = governor.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                governor.ready(&cancel).await.unwrap();
                start.elapsed()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap() >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_wait() {
        let governor = RateGovernor::new();
        let cancel = CancellationToken::new();
        governor.suspend(Duration::from_secs(60));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = governor.ready(&cancel).await;
        assert!(matches!(result, Err(HarvestError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

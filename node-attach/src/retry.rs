//! Bounded exponential backoff for polling loops.
//!
//! Every wait in the engine (device appearance, multipath holders, format
//! retries, resource deletion) is a [`Probe`] driven by [`retry`] under a
//! [`RetryPolicy`]. A fresh [`Backoff`] is created per call; no retry state
//! is shared between operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AttachError, Result};
use crate::metrics;

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Each wait is drawn uniformly from `interval * (1 +/- randomization_factor)`.
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// Total budget; the engine never sleeps past it.
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    const MAX_INTERVAL: Duration = Duration::from_secs(60);

    /// Schedule for waiting on kernel state: 1s, growing by sqrt(2).
    pub fn polling(max_elapsed: Duration) -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 1.414,
            randomization_factor: 0.1,
            max_interval: Self::MAX_INTERVAL,
            max_elapsed,
        }
    }

    /// Schedule for retrying filesystem creation: 2s, doubling.
    pub fn format(max_elapsed: Duration) -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_interval: Self::MAX_INTERVAL,
            max_elapsed,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial_interval,
            start: Instant::now(),
        }
    }
}

/// One run of a [`RetryPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    start: Instant,
}

impl Backoff {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Next wait, or `None` once waiting would exceed the budget.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let next = randomize(self.current, self.policy.randomization_factor);
        self.current = self
            .current
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_interval);

        if self.elapsed() + next > self.policy.max_elapsed {
            return None;
        }
        Some(next)
    }
}

fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let secs = interval.as_secs_f64();
    let delta = factor * secs;
    let jittered = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Result of a single probe attempt.
#[derive(Debug)]
pub enum ProbeOutcome<T> {
    /// Done; stop retrying.
    Ready(T),
    /// State not there yet; the reason is reported to the notifier.
    Retry(String),
    /// Give up immediately.
    Fatal(AttachError),
}

/// A check that is repeated until it is ready.
pub trait Probe {
    type Output;

    fn probe(&mut self) -> impl Future<Output = ProbeOutcome<Self::Output>>;
}

/// [`Probe`] built from a closure returning a future.
pub struct FnProbe<F>(F);

pub fn probe_fn<F, Fut, T>(f: F) -> FnProbe<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T>>,
{
    FnProbe(f)
}

impl<F, Fut, T> Probe for FnProbe<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T>>,
{
    type Output = T;

    fn probe(&mut self) -> impl Future<Output = ProbeOutcome<T>> {
        (self.0)()
    }
}

/// Drive `probe` under `policy`, logging each wait.
pub async fn retry<P: Probe>(
    policy: &RetryPolicy,
    operation: &'static str,
    probe: P,
) -> Result<P::Output> {
    retry_notify(policy, operation, probe, |reason, wait| {
        debug!(operation, reason, wait = ?wait, "Not ready, retrying");
        metrics::record_retry(operation);
    })
    .await
}

/// Drive `probe` under `policy`, calling `notify` before every wait.
///
/// The probe always runs at least once. When the next wait would cross
/// `max_elapsed` the loop ends with [`AttachError::DeadlineExceeded`].
pub async fn retry_notify<P, N>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut probe: P,
    mut notify: N,
) -> Result<P::Output>
where
    P: Probe,
    N: FnMut(&str, Duration),
{
    let mut backoff = policy.backoff();
    loop {
        let reason = match probe.probe().await {
            ProbeOutcome::Ready(value) => return Ok(value),
            ProbeOutcome::Fatal(e) => return Err(e),
            ProbeOutcome::Retry(reason) => reason,
        };

        let Some(wait) = backoff.next_backoff() else {
            let elapsed = backoff.elapsed();
            warn!(operation, reason = %reason, elapsed = ?elapsed, "Giving up");
            return Err(AttachError::DeadlineExceeded { operation, elapsed });
        };

        notify(&reason, wait);
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    #[test]
    fn test_randomize_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let d = randomize(base, 0.1);
            assert!(d >= Duration::from_secs(9) && d <= Duration::from_secs(11));
        }
        assert_eq!(randomize(base, 0.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_stops_at_budget() {
        let policy = RetryPolicy {
            randomization_factor: 0.0,
            ..RetryPolicy::format(Duration::from_secs(30))
        };
        let mut backoff = policy.backoff();
        let mut waits = Vec::new();
        while let Some(wait) = backoff.next_backoff() {
            waits.push(wait);
            tokio::time::sleep(wait).await;
        }
        // a further 32s wait after 30s elapsed would overshoot
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_interval() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(50),
            randomization_factor: 0.0,
            ..RetryPolicy::format(Duration::from_secs(3600))
        };
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(50)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = Cell::new(0);
        let probe = probe_fn(|| {
            attempts.set(attempts.get() + 1);
            let n = attempts.get();
            async move {
                if n < 3 {
                    ProbeOutcome::Retry(format!("attempt {n}"))
                } else {
                    ProbeOutcome::Ready(n)
                }
            }
        });

        let result = retry(&RetryPolicy::polling(Duration::from_secs(90)), "test", probe)
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_law() {
        let budget = Duration::from_secs(10);
        let start = Instant::now();
        let attempts = Cell::new(0u32);
        let probe = probe_fn(|| {
            attempts.set(attempts.get() + 1);
            async { ProbeOutcome::<()>::Retry("never".into()) }
        });

        let err = retry(&RetryPolicy::polling(budget), "never_ready", probe)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AttachError::DeadlineExceeded {
                operation: "never_ready",
                ..
            }
        ));
        assert!(err.is_timeout());
        assert!(start.elapsed() <= budget);
        assert!(attempts.get() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_zero_budget_probes_once() {
        let attempts = Cell::new(0u32);
        let probe = probe_fn(|| {
            attempts.set(attempts.get() + 1);
            async { ProbeOutcome::<()>::Retry("no".into()) }
        });
        let err = retry(&RetryPolicy::polling(Duration::ZERO), "zero", probe).await;
        assert!(err.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fatal_stops_immediately() {
        let start = Instant::now();
        let attempts = Cell::new(0u32);
        let probe = probe_fn(|| {
            attempts.set(attempts.get() + 1);
            async { ProbeOutcome::<()>::Fatal(AttachError::UnsupportedFilesystem("zfs".into())) }
        });

        let err = retry(&RetryPolicy::polling(Duration::from_secs(90)), "fatal", probe)
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::UnsupportedFilesystem(_)));
        assert_eq!(attempts.get(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_sees_every_wait() {
        let attempts = Cell::new(0u32);
        let probe = probe_fn(|| {
            attempts.set(attempts.get() + 1);
            let n = attempts.get();
            async move {
                if n < 4 {
                    ProbeOutcome::Retry("pending".into())
                } else {
                    ProbeOutcome::Ready(())
                }
            }
        });

        let mut notified = Vec::new();
        retry_notify(
            &RetryPolicy::polling(Duration::from_secs(90)),
            "notify",
            probe,
            |reason, wait| notified.push((reason.to_string(), wait)),
        )
        .await
        .unwrap();

        assert_eq!(notified.len(), 3);
        assert!(notified.iter().all(|(r, _)| r == "pending"));
        assert!(notified[0].1 <= Duration::from_millis(1100));
    }

    struct Countdown(u32);

    impl Probe for Countdown {
        type Output = &'static str;

        async fn probe(&mut self) -> ProbeOutcome<&'static str> {
            if self.0 == 0 {
                ProbeOutcome::Ready("done")
            } else {
                self.0 -= 1;
                ProbeOutcome::Retry(format!("{} left", self.0))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_struct_probe() {
        let out = retry(
            &RetryPolicy::polling(Duration::from_secs(90)),
            "countdown",
            Countdown(2),
        )
        .await
        .unwrap();
        assert_eq!(out, "done");
    }
}

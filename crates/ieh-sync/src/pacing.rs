//! Outbound request pacing shared by every worker in a run.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub min_interval: Duration,
    pub max_multiplier: u32,
    /// Upper bound of the random extra wait, as a fraction of the effective interval.
    pub jitter_ratio: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            max_multiplier: 16,
            jitter_ratio: 0.2,
        }
    }
}

/// Spaces grants at least `min_interval * multiplier` apart, measured from the
/// previous grant. Callers queue on the internal lock, so concurrent workers
/// are granted one at a time.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    last_grant: Mutex<Option<Instant>>,
    multiplier: AtomicU32,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config: RateLimiterConfig {
                max_multiplier: config.max_multiplier.max(1),
                jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
                ..config
            },
            last_grant: Mutex::new(None),
            multiplier: AtomicU32::new(1),
        }
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    /// Waits until the next request may go out and returns the grant instant.
    pub async fn acquire(&self) -> Instant {
        let mut last = self.last_grant.lock().await;
        if let Some(previous) = *last {
            let interval = self.effective_interval();
            let ready_at = previous + interval + self.jitter(interval);
            if ready_at > Instant::now() {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "pacing outbound request");
                sleep_until(ready_at).await;
            }
        }
        let granted = Instant::now();
        *last = Some(granted);
        granted
    }

    /// Doubles the backoff multiplier, saturating at the configured ceiling.
    pub fn report_throttled(&self) -> u32 {
        let ceiling = self.config.max_multiplier;
        let previous = self
            .multiplier
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| {
                Some(m.saturating_mul(2).min(ceiling))
            })
            .unwrap_or(ceiling);
        let current = previous.saturating_mul(2).min(ceiling);
        warn!(multiplier = current, "throttled; widening request interval");
        current
    }

    pub fn report_success(&self) {
        if self.multiplier.swap(1, Ordering::SeqCst) != 1 {
            debug!("request interval back to baseline");
        }
    }

    pub fn current_multiplier(&self) -> u32 {
        self.multiplier.load(Ordering::SeqCst)
    }

    /// Baseline interval times the current multiplier, without jitter.
    pub fn effective_interval(&self) -> Duration {
        self.config.min_interval.saturating_mul(self.current_multiplier())
    }

    fn jitter(&self, interval: Duration) -> Duration {
        if self.config.jitter_ratio <= 0.0 || interval.is_zero() {
            return Duration::ZERO;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.config.jitter_ratio);
        interval.mul_f64(fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(interval_ms: u64, ceiling: u32, jitter: f64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            min_interval: Duration::from_millis(interval_ms),
            max_multiplier: ceiling,
            jitter_ratio: jitter,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_grant_is_immediate_and_next_waits_the_interval() {
        let limiter = limiter(500, 16, 0.0);
        let start = Instant::now();
        let first = limiter.acquire().await;
        assert_eq!(first, start);

        let second = limiter.acquire().await;
        assert!(second - first >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_widens_spacing_until_success() {
        let limiter = limiter(100, 16, 0.0);
        let first = limiter.acquire().await;
        limiter.report_throttled();
        limiter.report_throttled();
        let second = limiter.acquire().await;
        assert!(second - first >= Duration::from_millis(400));

        limiter.report_success();
        let third = limiter.acquire().await;
        assert!(third - second >= Duration::from_millis(100));
        assert!(third - second < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_ratio() {
        let limiter = limiter(1_000, 4, 0.2);
        let mut previous = limiter.acquire().await;
        for _ in 0..5 {
            let next = limiter.acquire().await;
            let gap = next - previous;
            assert!(gap >= Duration::from_millis(1_000));
            assert!(gap <= Duration::from_millis(1_200) + Duration::from_millis(1));
            previous = next;
        }
    }

    #[test]
    fn multiplier_doubles_to_ceiling_and_resets() {
        let limiter = limiter(100, 10, 0.0);
        let observed: Vec<u32> = (0..5).map(|_| limiter.report_throttled()).collect();
        assert_eq!(observed, vec![2, 4, 8, 10, 10]);
        assert_eq!(limiter.effective_interval(), Duration::from_millis(1_000));
        limiter.report_success();
        assert_eq!(limiter.current_multiplier(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_serialized() {
        let limiter = Arc::new(limiter(250, 16, 0.0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }
        grants.sort();
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }
}

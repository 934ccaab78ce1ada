//! Bandwidth and request-rate control shared by every worker

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;
use tracing::{debug, info};

const WINDOW: Duration = Duration::from_secs(1);

struct Window {
    limit: Option<u64>,
    started: Instant,
    bytes: u64,
    total_bytes: u64,
    total_wait: Duration,
}

/// Caps aggregate throughput in bytes per second over a 1-second window.
pub struct BandwidthThrottle {
    state: Mutex<Window>,
}

impl BandwidthThrottle {
    /// `bytes_per_second` of `None` or 0 disables the cap.
    pub fn new(bytes_per_second: Option<u64>) -> Self {
        Self {
            state: Mutex::new(Window {
                limit: bytes_per_second.filter(|l| *l > 0),
                started: Instant::now(),
                bytes: 0,
                total_bytes: 0,
                total_wait: Duration::ZERO,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Megabits per second, as used in configuration. 0 means unlimited.
    pub fn from_mbps(mbps: f64) -> Self {
        Self::new(mbps_to_bytes(mbps))
    }

    pub fn set_limit(&self, bytes_per_second: Option<u64>) {
        let mut state = self.state.lock();
        state.limit = bytes_per_second.filter(|l| *l > 0);
        state.started = Instant::now();
        state.bytes = 0;
        info!(limit = ?state.limit, "Bandwidth limit updated");
    }

    pub fn limit(&self) -> Option<u64> {
        self.state.lock().limit
    }

    /// Accounts `byte_count` and sleeps long enough to keep the window's
    /// average rate at or under the cap.
    pub async fn throttle(&self, byte_count: usize) {
        let wait = self.reserve(byte_count, Instant::now());
        if !wait.is_zero() {
            debug!(?wait, byte_count, "Throttling transfer");
            tokio::time::sleep(wait).await;
        }
    }

    fn reserve(&self, byte_count: usize, now: Instant) -> Duration {
        let mut state = self.state.lock();
        state.total_bytes += byte_count as u64;

        let Some(limit) = state.limit else {
            return Duration::ZERO;
        };

        if now.saturating_duration_since(state.started) >= WINDOW {
            state.started = now;
            state.bytes = 0;
        }
        state.bytes += byte_count as u64;

        let elapsed = now.saturating_duration_since(state.started);
        let required = Duration::from_secs_f64(state.bytes as f64 / limit as f64);
        let wait = required.saturating_sub(elapsed);
        state.total_wait += wait;
        wait
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn total_wait(&self) -> Duration {
        self.state.lock().total_wait
    }
}

impl Default for BandwidthThrottle {
    fn default() -> Self {
        Self::unlimited()
    }
}

pub fn mbps_to_bytes(mbps: f64) -> Option<u64> {
    if mbps.is_finite() && mbps > 0.0 {
        Some((mbps * 1_000_000.0 / 8.0) as u64)
    } else {
        None
    }
}

/// Articles-per-second limiter built on `governor`.
#[derive(Clone)]
pub struct ArticleRateLimiter {
    limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl ArticleRateLimiter {
    /// `articles_per_second` of 0 means unlimited.
    pub fn new(articles_per_second: u32) -> Self {
        let limiter = NonZeroU32::new(articles_per_second)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        Self { limiter }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub async fn wait_for_article(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }
}

impl Default for ArticleRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbps_conversion() {
        assert_eq!(mbps_to_bytes(8.0), Some(1_000_000));
        assert_eq!(mbps_to_bytes(0.0), None);
        assert_eq!(mbps_to_bytes(f64::NAN), None);
    }

    #[test]
    fn test_reserve_computes_minimal_wait() {
        let throttle = BandwidthThrottle::new(Some(1000));
        let start = throttle.state.lock().started;

        // 500 bytes at t=0 need 0.5s of window
        let wait = throttle.reserve(500, start);
        assert_eq!(wait, Duration::from_millis(500));

        // 250 more at t=0.7 need 0.75s in total
        let wait = throttle.reserve(250, start + Duration::from_millis(700));
        assert_eq!(wait, Duration::from_millis(50));

        // a new window starts after a second
        let wait = throttle.reserve(100, start + Duration::from_millis(1200));
        assert_eq!(wait, Duration::from_millis(100));
        assert_eq!(throttle.total_bytes(), 850);
    }

    #[test]
    fn test_unlimited_never_waits() {
        let throttle = BandwidthThrottle::unlimited();
        assert_eq!(throttle.reserve(10_000_000, Instant::now()), Duration::ZERO);
        assert_eq!(throttle.limit(), None);

        throttle.set_limit(Some(10));
        assert_eq!(throttle.limit(), Some(10));
        throttle.set_limit(Some(0));
        assert_eq!(throttle.limit(), None);
    }

    #[tokio::test]
    async fn test_throttle_sleeps_over_cap() {
        let throttle = BandwidthThrottle::new(Some(10_000));
        let start = Instant::now();
        throttle.throttle(1_000).await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_cap_is_shared_across_workers() {
        let throttle = Arc::new(BandwidthThrottle::new(Some(10_000)));
        let start = Instant::now();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        throttle.throttle(1_000).await;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        // 20 kB at 10 kB/s in total; each worker alone would need only 0.5s
        assert!(start.elapsed() >= Duration::from_millis(1_500));
        assert_eq!(throttle.total_bytes(), 20_000);
        assert!(throttle.total_wait() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_article_limiter() {
        let limiter = ArticleRateLimiter::unlimited();
        assert!(!limiter.is_enabled());
        let start = Instant::now();
        for _ in 0..100 {
            limiter.wait_for_article().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        let limited = ArticleRateLimiter::new(10);
        assert!(limited.is_enabled());
        limited.wait_for_article().await;
    }
}

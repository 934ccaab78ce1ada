//! Metrics recorder for article transfers
//!
//! Every call is a no-op until a `metrics` recorder is installed.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "newsvault_articles_posted_total",
        "Articles accepted by a news server"
    );
    describe_counter!(
        "newsvault_articles_fetched_total",
        "Articles retrieved from a news server"
    );
    describe_counter!(
        "newsvault_article_failures_total",
        "Article posts or fetches that failed after retries"
    );
    describe_counter!("newsvault_bytes_posted_total", "Encoded bytes posted");
    describe_counter!("newsvault_bytes_fetched_total", "Encoded bytes fetched");
    describe_counter!("newsvault_retries_total", "Retry attempts made");
    describe_counter!(
        "newsvault_segments_recovered_total",
        "Segments rebuilt from a redundant copy, parity or erasure shards"
    );

    describe_counter!(
        "newsvault_cache_lookups_total",
        "Segment cache lookups, labelled hit or miss"
    );
    describe_counter!("newsvault_cache_evictions_total", "Segments evicted from the cache");

    describe_gauge!(
        "newsvault_queue_depth",
        "Items waiting in a transfer queue"
    );

    describe_histogram!(
        "newsvault_article_duration_seconds",
        "Time to post or fetch a single article"
    );
}

pub fn record_article_posted(server: &str, bytes: usize) {
    counter!("newsvault_articles_posted_total", "server" => server.to_string()).increment(1);
    counter!("newsvault_bytes_posted_total", "server" => server.to_string())
        .increment(bytes as u64);
}

pub fn record_article_fetched(server: &str, bytes: usize) {
    counter!("newsvault_articles_fetched_total", "server" => server.to_string()).increment(1);
    counter!("newsvault_bytes_fetched_total", "server" => server.to_string())
        .increment(bytes as u64);
}

pub fn record_article_failure(direction: &str, kind: &str) {
    counter!("newsvault_article_failures_total", "direction" => direction.to_string(), "kind" => kind.to_string()).increment(1);
}

pub fn record_retry() {
    counter!("newsvault_retries_total").increment(1);
}

/// `method` is `copy`, `parity` or `erasure`.
pub fn record_segment_recovered(method: &str) {
    counter!("newsvault_segments_recovered_total", "method" => method.to_string()).increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("newsvault_cache_lookups_total", "outcome" => outcome).increment(1);
}

pub fn record_cache_eviction() {
    counter!("newsvault_cache_evictions_total").increment(1);
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    gauge!("newsvault_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

pub fn record_article_duration(direction: &str, duration: Duration) {
    histogram!("newsvault_article_duration_seconds", "direction" => direction.to_string())
        .record(duration.as_secs_f64());
}

/// Times one article operation and records it on `stop`.
pub struct ArticleTimer {
    direction: &'static str,
    start_time: Instant,
}

impl ArticleTimer {
    pub fn start(direction: &'static str) -> Self {
        Self {
            direction,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Records the duration and returns it in whole milliseconds.
    pub fn stop(self) -> u64 {
        let elapsed = self.start_time.elapsed();
        record_article_duration(self.direction, elapsed);
        elapsed.as_millis() as u64
    }
}

//! Metrics and observability module
//!
//! Counters and histograms for article posts and fetches, retries,
//! recoveries, the segment cache and queue depth, recorded through the
//! `metrics` facade.

pub mod recorder;

pub use recorder::{
    init_metrics, record_article_duration, record_article_failure, record_article_fetched,
    record_article_posted, record_cache_eviction, record_cache_lookup, record_retry,
    record_segment_recovered, set_queue_depth, ArticleTimer,
};

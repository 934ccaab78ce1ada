//! Download path: fetch, verify, recover and reassemble

pub mod cache;
pub mod reconstructor;
pub mod retriever;
pub mod worker;

pub use cache::{CacheStats, SegmentCache, DEFAULT_CACHE_BYTES, DEFAULT_CACHE_ITEMS};
pub use reconstructor::{Reconstructor, SegmentSet};
pub use retriever::{DownloadCheckpoint, DownloadReport, DownloadRetriever};
pub use worker::{write_output, write_unpacked, DownloadJob, DownloadRunner};

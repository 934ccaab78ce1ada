//! Upload path: segment, protect, encode and post

pub mod pipeline;
pub mod worker;

pub use pipeline::{ArticleFailure, UploadOptions, UploadPipeline, UploadReport};
pub use worker::{UploadJob, UploadRunner};

use thiserror::Error;

/// Failure of a whole upload or download job.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Segment error: {0}")]
    Segment(#[from] crate::segment::SegmentError),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] crate::integrity::IntegrityError),

    #[error("Network error: {0}")]
    Network(#[from] crate::network::NetworkError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No secret key configured")]
    MissingSecret,

    #[error("{failed} of {total} articles failed for {file_id}: {first_error}")]
    ArticlesFailed {
        file_id: String,
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error("Transfer of {0} was interrupted")]
    Interrupted(String),
}

pub type TransferResult<T> = Result<T, TransferError>;

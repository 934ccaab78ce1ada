use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient data for recovery: {missing} segment(s) missing from parity group")]
    InsufficientData { missing: usize },

    #[error("Insufficient shards for reconstruction: need {needed}, have {available}")]
    InsufficientShards { needed: usize, available: usize },

    #[error("{size} bytes at {segment_size} bytes per segment exceeds the segment index range")]
    TooManySegments { size: u64, segment_size: usize },

    #[error("Invalid segment size: {0}")]
    InvalidSegmentSize(String),

    #[error("Invalid packed bundle: {0}")]
    InvalidPack(String),

    #[error("Invalid redundancy configuration: {0}")]
    InvalidRedundancy(String),

    #[error("Missing index {index} is outside parity group of {group_len}")]
    MissingIndexOutOfRange { index: usize, group_len: usize },
}

pub type Result<T> = std::result::Result<T, SegmentError>;

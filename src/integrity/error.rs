use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Checksum mismatch for segment {segment_index}: expected {}, got {}", hex::encode(.expected), hex::encode(.actual))]
    ChecksumMismatch {
        segment_index: u32,
        expected: [u8; 32],
        actual: [u8; 32],
    },

    #[error("File checksum mismatch for {file_id}: expected {}, got {}", hex::encode(.expected), hex::encode(.actual))]
    FileChecksumMismatch {
        file_id: String,
        expected: [u8; 32],
        actual: [u8; 32],
    },

    #[error("File {file_id} is unrecoverable: segments {missing:?} could not be retrieved or rebuilt")]
    Unrecoverable { file_id: String, missing: Vec<u32> },

    #[error("Manifest for {file_id} is inconsistent: {reason}")]
    InvalidManifest { file_id: String, reason: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type IntegrityResult<T> = Result<T, IntegrityError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid yEnc data: {0}")]
    InvalidYenc(String),

    #[error("yEnc size mismatch: expected {expected} bytes, decoded {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("yEnc CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Invalid redundancy tag: {0}")]
    InvalidTag(String),

    #[error("Invalid article: {0}")]
    InvalidArticle(String),

    #[error("Invalid secret key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

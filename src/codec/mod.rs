pub mod article;
pub mod envelope;
pub mod error;
pub mod header;
pub mod obfuscation;
pub mod yenc;

pub use article::Article;
pub use envelope::{decode_body, encode_body};
pub use error::{CodecError, Result};
pub use header::{SegmentHeader, HEADER_MAGIC, HEADER_VERSION, MAX_METADATA_LEN};
pub use obfuscation::{
    ObfuscatedIdentity, ObfuscationCodec, MESSAGE_ID_DOMAIN, MESSAGE_ID_LOCAL_LEN,
    WIRE_SUBJECT_LEN,
};
pub use yenc::{YencBlock, YencValue, DEFAULT_LINE_LENGTH};

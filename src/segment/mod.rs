pub mod erasure;
pub mod error;
pub mod packing;
pub mod redundancy;
pub mod segmenter;
pub mod types;

pub use erasure::ErasureCoder;
pub use error::{Result, SegmentError};
pub use packing::{unpack, FilePacker, PackEntry, PackedBundle, PACK_HEADER_RESERVE};
pub use redundancy::{
    calculate_parity, extract_original_data, recover_segment, redundancy_overhead,
    RedundancyEngine, RedundancyOverhead, RedundantCopy, REDUNDANCY_TAG_PREFIX,
};
pub use segmenter::{SegmentIter, Segmenter, DEFAULT_SEGMENT_SIZE};
pub use types::{
    ArticleKind, ArticleRef, FileManifest, ParityRecord, RedundancyMode, Segment, SegmentRecord,
    SegmentState,
};

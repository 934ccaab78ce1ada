//! Segment payload <-> article body

use bytes::Bytes;

use super::error::Result;
use super::header::{self, SegmentHeader};
use super::{obfuscation, yenc};

/// Header-prefixed payload as a single-part yEnc block under a random name.
pub fn encode_body(header: &SegmentHeader, payload: &[u8], line_length: usize) -> Result<Bytes> {
    let framed = header::wrap(header, payload)?;
    let name = obfuscation::obfuscated_file_name();
    Ok(yenc::wrap(&framed, &name, line_length))
}

/// Reverses [`encode_body`]: yEnc decode, then split off the segment header.
pub fn decode_body(body: &[u8]) -> Result<(SegmentHeader, Bytes)> {
    let block = yenc::unwrap(body)?;
    let (header, payload) = header::split(&block.data)?;
    let offset = block.data.len() - payload.len();
    Ok((header, block.data.slice(offset..)))
}

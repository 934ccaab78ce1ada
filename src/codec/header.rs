use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::error::{CodecError, Result};

pub const HEADER_MAGIC: &[u8; 4] = b"NVSG";
pub const HEADER_VERSION: u16 = 1;
pub const MAX_METADATA_LEN: usize = 1024 * 1024;

/// magic(4) + version(2) + metadata length(4)
pub const HEADER_PREFIX_LEN: usize = 10;

/// Binary envelope prepended to each segment payload before yEnc.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentHeader {
    pub segment_index: u32,
    pub total_segments: u32,
    pub file_id: String,
    pub file_size: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SegmentHeader {
    pub fn new(segment_index: u32, total_segments: u32, file_id: &str, file_size: u64) -> Self {
        Self {
            segment_index,
            total_segments,
            file_id: file_id.to_string(),
            file_size,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

pub fn encode(header: &SegmentHeader) -> Result<Bytes> {
    let block = serde_json::to_vec(header)
        .map_err(|e| CodecError::InvalidHeader(format!("serialize: {e}")))?;
    if block.len() > MAX_METADATA_LEN {
        return Err(CodecError::InvalidHeader(format!(
            "metadata block of {} bytes exceeds {MAX_METADATA_LEN}",
            block.len()
        )));
    }

    let mut out = BytesMut::with_capacity(HEADER_PREFIX_LEN + block.len());
    out.put_slice(HEADER_MAGIC);
    out.put_u16(HEADER_VERSION);
    out.put_u32(block.len() as u32);
    out.put_slice(&block);
    Ok(out.freeze())
}

/// Prepends the encoded header to `payload`.
pub fn wrap(header: &SegmentHeader, payload: &[u8]) -> Result<Bytes> {
    let head = encode(header)?;
    let mut out = BytesMut::with_capacity(head.len() + payload.len());
    out.put_slice(&head);
    out.put_slice(payload);
    Ok(out.freeze())
}

pub fn decode(data: &[u8]) -> Result<SegmentHeader> {
    split(data).map(|(header, _)| header)
}

/// Parses the header and returns it with the remaining payload bytes.
pub fn split(data: &[u8]) -> Result<(SegmentHeader, &[u8])> {
    if data.len() < 4 || &data[..4] != HEADER_MAGIC {
        return Err(CodecError::InvalidHeader("bad magic".into()));
    }
    if data.len() < HEADER_PREFIX_LEN {
        return Err(CodecError::InvalidHeader("truncated prefix".into()));
    }

    let version = u16::from_be_bytes([data[4], data[5]]);
    if version != HEADER_VERSION {
        return Err(CodecError::InvalidHeader(format!(
            "unsupported version {version}"
        )));
    }

    let len = u32::from_be_bytes([data[6], data[7], data[8], data[9]]) as usize;
    if len > MAX_METADATA_LEN {
        return Err(CodecError::InvalidHeader(format!(
            "metadata length {len} exceeds {MAX_METADATA_LEN}"
        )));
    }
    let end = HEADER_PREFIX_LEN + len;
    if data.len() < end {
        return Err(CodecError::InvalidHeader(format!(
            "metadata length {len} exceeds available {} bytes",
            data.len() - HEADER_PREFIX_LEN
        )));
    }

    let header: SegmentHeader = serde_json::from_slice(&data[HEADER_PREFIX_LEN..end])
        .map_err(|e| CodecError::InvalidHeader(format!("metadata: {e}")))?;
    Ok((header, &data[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_empty_metadata() {
        let header = SegmentHeader::new(3, 14, "file-1", 10_485_760);
        let encoded = encode(&header).unwrap();
        assert_eq!(&encoded[..4], HEADER_MAGIC);
        assert_eq!(decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_round_trip_with_metadata() {
        let header = SegmentHeader::new(0, 1, "f", 5)
            .with_meta("redundancy_index", 2u64)
            .with_meta("kind", "data")
            .with_meta("nested", serde_json::json!({"a": [1, 2, 3]}));
        let decoded = decode(&encode(&header).unwrap()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.meta_u64("redundancy_index"), Some(2));
        assert_eq!(decoded.meta_str("kind"), Some("data"));
    }

    #[test]
    fn test_split_returns_payload() {
        let header = SegmentHeader::new(1, 2, "abc", 10);
        let wrapped = wrap(&header, b"payload bytes").unwrap();
        let (parsed, payload) = split(&wrapped).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let header = SegmentHeader::new(0, 1, "f", 0);
        let mut encoded = encode(&header).unwrap().to_vec();
        encoded[0] = b'X';
        assert!(matches!(decode(&encoded), Err(CodecError::InvalidHeader(_))));
        assert!(matches!(decode(b"NV"), Err(CodecError::InvalidHeader(_))));
    }

    #[test]
    fn test_bad_version_and_length_rejected() {
        let header = SegmentHeader::new(0, 1, "f", 0);
        let encoded = encode(&header).unwrap().to_vec();

        let mut wrong_version = encoded.clone();
        wrong_version[5] = 9;
        assert!(decode(&wrong_version).is_err());

        let truncated = &encoded[..encoded.len() - 3];
        assert!(decode(truncated).is_err());

        let mut oversized = encoded.clone();
        oversized[6..10].copy_from_slice(&(MAX_METADATA_LEN as u32 + 1).to_be_bytes());
        assert!(decode(&oversized).is_err());
    }
}

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;

use super::error::{Result, SegmentError};
use crate::codec::{ObfuscatedIdentity, ObfuscationCodec};

pub const REDUNDANCY_TAG_PREFIX: &[u8] = b"REDUNDANCY:";

/// Longest tag line `extract_original_data` will look for a newline in.
const MAX_TAG_LEN: usize = 256;
const SALT_LEN: usize = 8;

/// One posted variant of a segment.
#[derive(Debug, Clone)]
pub struct RedundantCopy {
    pub redundancy_index: u32,
    pub data: Bytes,
    pub identity: ObfuscatedIdentity,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedundancyOverhead {
    pub original_size: u64,
    pub redundancy_level: u32,
    pub total_size: u64,
    pub overhead_bytes: u64,
    pub overhead_percent: f64,
}

pub struct RedundancyEngine {
    codec: Arc<ObfuscationCodec>,
}

impl RedundancyEngine {
    pub fn new(codec: Arc<ObfuscationCodec>) -> Self {
        Self { codec }
    }

    /// Returns `level` byte-distinct variants of `data`. Copy 0 is the data
    /// itself; the rest carry a salted `REDUNDANCY:` tag line.
    pub fn create_redundant_segments(
        &self,
        data: &Bytes,
        folder_id: &str,
        segment_index: u32,
        level: u32,
    ) -> Vec<RedundantCopy> {
        (0..level.max(1))
            .map(|i| RedundantCopy {
                redundancy_index: i,
                data: self.variant(data, segment_index, i),
                identity: self.codec.identity(folder_id, segment_index, i),
            })
            .collect()
    }

    /// The bytes posted for one copy. A fresh salt is drawn each call, so a
    /// re-post of the same copy never repeats an earlier body.
    pub fn variant(&self, data: &Bytes, segment_index: u32, redundancy_index: u32) -> Bytes {
        if redundancy_index == 0 {
            data.clone()
        } else {
            tag_copy(data, redundancy_index, segment_index)
        }
    }

    pub fn codec(&self) -> &Arc<ObfuscationCodec> {
        &self.codec
    }
}

fn tag_copy(data: &Bytes, redundancy_index: u32, segment_index: u32) -> Bytes {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let tag = format!("{redundancy_index}:{segment_index}:{}\n", hex::encode(salt));

    let mut out = BytesMut::with_capacity(REDUNDANCY_TAG_PREFIX.len() + tag.len() + data.len());
    out.put_slice(REDUNDANCY_TAG_PREFIX);
    out.put_slice(tag.as_bytes());
    out.put_slice(data);
    out.freeze()
}

/// Strips a redundancy tag if one is present, else returns the input.
///
/// A payload only counts as tagged when the whole tag line is well formed:
/// `REDUNDANCY:<copy>:<segment>:<16 hex>` followed by a newline.
pub fn extract_original_data(payload: &Bytes) -> Bytes {
    match tag_len(payload) {
        Some(len) => payload.slice(len..),
        None => payload.clone(),
    }
}

fn tag_len(payload: &[u8]) -> Option<usize> {
    if !payload.starts_with(REDUNDANCY_TAG_PREFIX) {
        return None;
    }
    let window = &payload[..payload.len().min(MAX_TAG_LEN)];
    let newline = window.iter().position(|&b| b == b'\n')?;
    let fields = std::str::from_utf8(&payload[REDUNDANCY_TAG_PREFIX.len()..newline]).ok()?;

    let mut parts = fields.split(':');
    let copy = parts.next()?.parse::<u32>().ok()?;
    parts.next()?.parse::<u32>().ok()?;
    let salt = parts.next()?;
    if copy == 0
        || parts.next().is_some()
        || salt.len() != SALT_LEN * 2
        || !salt.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return None;
    }
    Some(newline + 1)
}

/// Byte-wise XOR of all segments, each zero-padded to the longest.
pub fn calculate_parity(segments: &[Bytes]) -> Bytes {
    let max_len = segments.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut parity = vec![0u8; max_len];
    for segment in segments {
        for (p, b) in parity.iter_mut().zip(segment.iter()) {
            *p ^= b;
        }
    }
    Bytes::from(parity)
}

/// Rebuilds the single missing member of a parity group.
///
/// `group` holds every member in group order with `None` at `missing_index`.
/// Trailing zero bytes are stripped from the result, so callers that know
/// the true length should pad it back.
pub fn recover_segment(
    group: &[Option<Bytes>],
    parity: &Bytes,
    missing_index: usize,
) -> Result<Bytes> {
    if missing_index >= group.len() {
        return Err(SegmentError::MissingIndexOutOfRange {
            index: missing_index,
            group_len: group.len(),
        });
    }
    let missing = group.iter().filter(|s| s.is_none()).count();
    if missing != 1 || group[missing_index].is_some() {
        return Err(SegmentError::InsufficientData {
            missing: missing.max(1),
        });
    }

    let mut recovered = parity.to_vec();
    for segment in group.iter().flatten() {
        for (r, b) in recovered.iter_mut().zip(segment.iter()) {
            *r ^= b;
        }
    }

    let end = recovered.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    recovered.truncate(end);
    Ok(Bytes::from(recovered))
}

pub fn redundancy_overhead(data_size: u64, level: u32) -> RedundancyOverhead {
    const TAG_ESTIMATE: u64 = 64;
    let level = level.max(1);
    let total_size = data_size * level as u64 + TAG_ESTIMATE * (level as u64 - 1);
    let overhead_bytes = total_size - data_size;
    let overhead_percent = if data_size > 0 {
        overhead_bytes as f64 / data_size as f64 * 100.0
    } else {
        0.0
    };
    RedundancyOverhead {
        original_size: data_size,
        redundancy_level: level,
        total_size,
        overhead_bytes,
        overhead_percent,
    }
}

//! Small-file packing
//!
//! Files below half a segment are concatenated into bundles so each one
//! does not cost a whole article set. A bundle is framed as a little-endian
//! `u32` header length, a JSON header listing every member, then the member
//! bytes back to back. Bundles upload like any other file and carry their
//! member list in the manifest.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{Result, SegmentError};

pub const PACK_FORMAT_VERSION: u32 = 1;

/// Room kept in each bundle for the framing header.
pub const PACK_HEADER_RESERVE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntry {
    pub name: String,
    /// Offset within the data section, after the header.
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PackHeader {
    version: u32,
    file_count: usize,
    files: Vec<PackEntry>,
}

#[derive(Debug, Clone)]
pub struct PackedBundle {
    pub pack_id: String,
    pub entries: Vec<PackEntry>,
    pub data: Bytes,
}

impl PackedBundle {
    fn build(members: &[(String, Bytes)]) -> Result<Self> {
        let mut entries = Vec::with_capacity(members.len());
        let mut offset = 0u64;
        for (name, data) in members {
            entries.push(PackEntry {
                name: name.clone(),
                offset,
                size: data.len() as u64,
            });
            offset += data.len() as u64;
        }

        let header = serde_json::to_vec(&PackHeader {
            version: PACK_FORMAT_VERSION,
            file_count: entries.len(),
            files: entries.clone(),
        })
        .map_err(|e| SegmentError::InvalidPack(e.to_string()))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| SegmentError::InvalidPack("header too large".into()))?;

        let mut data = BytesMut::with_capacity(4 + header.len() + offset as usize);
        data.put_u32_le(header_len);
        data.put_slice(&header);
        for (_, member) in members {
            data.put_slice(member);
        }

        Ok(Self {
            pack_id: uuid::Uuid::new_v4().to_string(),
            entries,
            data: data.freeze(),
        })
    }
}

/// Groups small files into bundles no larger than one segment.
#[derive(Debug, Clone, Copy)]
pub struct FilePacker {
    segment_size: usize,
}

impl FilePacker {
    pub fn new(segment_size: usize) -> Result<Self> {
        if segment_size <= PACK_HEADER_RESERVE {
            return Err(SegmentError::InvalidSegmentSize(format!(
                "packing needs segments larger than {PACK_HEADER_RESERVE} bytes"
            )));
        }
        Ok(Self { segment_size })
    }

    /// Files smaller than half a segment are worth packing.
    pub fn should_pack(&self, size: usize) -> bool {
        size < self.segment_size / 2
    }

    /// Packs every file `should_pack` accepts, in input order. Larger files
    /// are left out for the caller to upload on their own.
    pub fn pack(&self, files: &[(String, Bytes)]) -> Result<Vec<PackedBundle>> {
        let mut bundles = Vec::new();
        let mut current: Vec<(String, Bytes)> = Vec::new();
        let mut current_size = 0usize;

        for (name, data) in files {
            if !self.should_pack(data.len()) {
                continue;
            }
            if current_size + data.len() + PACK_HEADER_RESERVE > self.segment_size
                && !current.is_empty()
            {
                bundles.push(PackedBundle::build(&current)?);
                current.clear();
                current_size = 0;
            }
            current.push((name.clone(), data.clone()));
            current_size += data.len();
        }
        if !current.is_empty() {
            bundles.push(PackedBundle::build(&current)?);
        }

        info!(files = files.len(), bundles = bundles.len(), "Packed small files");
        Ok(bundles)
    }
}

/// Splits a bundle back into `(name, data)` pairs.
pub fn unpack(data: &Bytes) -> Result<Vec<(String, Bytes)>> {
    if data.len() < 4 {
        return Err(SegmentError::InvalidPack("missing header length".into()));
    }
    let header_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let data_start = 4usize
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| SegmentError::InvalidPack("header runs past the end".into()))?;

    let header: PackHeader = serde_json::from_slice(&data[4..data_start])
        .map_err(|e| SegmentError::InvalidPack(e.to_string()))?;
    if header.version != PACK_FORMAT_VERSION {
        return Err(SegmentError::InvalidPack(format!(
            "unsupported version {}",
            header.version
        )));
    }
    if header.file_count != header.files.len() {
        return Err(SegmentError::InvalidPack(format!(
            "header lists {} files but counts {}",
            header.files.len(),
            header.file_count
        )));
    }

    let body = data.slice(data_start..);
    header
        .files
        .into_iter()
        .map(|entry| {
            let start = usize::try_from(entry.offset).ok();
            let end = start.and_then(|s| s.checked_add(usize::try_from(entry.size).ok()?));
            match (start, end) {
                (Some(start), Some(end)) if end <= body.len() => {
                    Ok((entry.name, body.slice(start..end)))
                }
                _ => Err(SegmentError::InvalidPack(format!(
                    "{} lies outside the bundle",
                    entry.name
                ))),
            }
        })
        .collect()
}

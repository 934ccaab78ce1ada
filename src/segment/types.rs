use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{Result, SegmentError};
use super::packing::PackEntry;
use crate::codec::ObfuscatedIdentity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    #[default]
    Pending,
    Posted,
    Verified,
    Failed,
}

/// One chunk of one file, as it flows through a single pipeline pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub file_id: String,
    pub segment_index: u32,
    pub total_segments: u32,
    pub size: usize,
    #[serde(with = "hex::serde")]
    pub content_hash: [u8; 32], // BLAKE3 of the raw chunk
    pub redundancy_index: u32,
    pub data_offset: u64,
    pub state: SegmentState,
    #[serde(skip)]
    pub data: Bytes,
}

/// How extra protection is produced for an upload job. Chosen once per job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RedundancyMode {
    #[default]
    None,
    UniqueCopies {
        level: u32,
    },
    Parity {
        group_size: usize,
    },
    ReedSolomon {
        data_shards: usize,
        parity_shards: usize,
    },
}

impl RedundancyMode {
    pub fn validate(&self) -> Result<()> {
        match *self {
            RedundancyMode::None => Ok(()),
            RedundancyMode::UniqueCopies { level } if level == 0 => Err(
                SegmentError::InvalidRedundancy("unique copy level must be >= 1".into()),
            ),
            RedundancyMode::Parity { group_size } if group_size < 2 => Err(
                SegmentError::InvalidRedundancy("parity group size must be >= 2".into()),
            ),
            RedundancyMode::ReedSolomon {
                data_shards,
                parity_shards,
            } if data_shards == 0 || parity_shards == 0 => Err(SegmentError::InvalidRedundancy(
                "data and parity shards must be > 0".into(),
            )),
            RedundancyMode::ReedSolomon {
                data_shards,
                parity_shards,
            } if data_shards + parity_shards > 256 => Err(SegmentError::InvalidRedundancy(
                "data + parity shards must not exceed 256".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Segments covered by one parity group, for the modes that have them.
    pub fn group_size(&self) -> Option<usize> {
        match *self {
            RedundancyMode::Parity { group_size } => Some(group_size),
            RedundancyMode::ReedSolomon { data_shards, .. } => Some(data_shards),
            _ => None,
        }
    }

    /// Number of copies posted for every data segment.
    pub fn copies_per_segment(&self) -> u32 {
        match *self {
            RedundancyMode::UniqueCopies { level } => level.max(1),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArticleKind {
    Data,
    Parity,
}

impl ArticleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleKind::Data => "data",
            ArticleKind::Parity => "parity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "data" => Some(ArticleKind::Data),
            "parity" => Some(ArticleKind::Parity),
            _ => None,
        }
    }
}

/// Where one posted copy lives on the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArticleRef {
    pub redundancy_index: u32,
    pub message_id: String,
    pub internal_subject: String,
    pub wire_subject: String,
    pub server: Option<String>,
    pub state: SegmentState,
}

impl ArticleRef {
    pub fn pending(redundancy_index: u32, identity: &ObfuscatedIdentity) -> Self {
        Self {
            redundancy_index,
            message_id: identity.message_id.clone(),
            internal_subject: identity.internal_subject.clone(),
            wire_subject: identity.wire_subject.clone(),
            server: None,
            state: SegmentState::Pending,
        }
    }

    pub fn identity(&self) -> ObfuscatedIdentity {
        ObfuscatedIdentity {
            internal_subject: self.internal_subject.clone(),
            wire_subject: self.wire_subject.clone(),
            message_id: self.message_id.clone(),
        }
    }

    pub fn is_posted(&self) -> bool {
        matches!(self.state, SegmentState::Posted | SegmentState::Verified)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub segment_index: u32,
    pub size: usize,
    #[serde(with = "hex::serde")]
    pub content_hash: [u8; 32],
    pub data_offset: u64,
    pub state: SegmentState,
    pub copies: Vec<ArticleRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParityRecord {
    pub group: u32,
    pub parity_index: u32,
    /// Segment indices covered by this parity block, in group order.
    pub members: Vec<u32>,
    pub size: usize,
    #[serde(with = "hex::serde")]
    pub content_hash: [u8; 32],
    pub article: Option<ArticleRef>,
}

/// Everything the download side needs to rebuild a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: String,
    pub folder_id: String,
    pub file_size: u64,
    #[serde(with = "hex::serde")]
    pub file_hash: [u8; 32],
    pub segment_size: usize,
    pub total_segments: u32,
    pub redundancy: RedundancyMode,
    pub segments: Vec<SegmentRecord>,
    pub parity: Vec<ParityRecord>,
    pub created_at: i64,
    /// Members of a packed bundle; empty for an ordinary file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packed_files: Vec<PackEntry>,
}

impl FileManifest {
    pub fn is_packed(&self) -> bool {
        !self.packed_files.is_empty()
    }

    pub fn segment(&self, index: u32) -> Option<&SegmentRecord> {
        self.segments.iter().find(|s| s.segment_index == index)
    }

    pub fn parity_for_group(&self, group: u32) -> Vec<&ParityRecord> {
        let mut records: Vec<_> = self.parity.iter().filter(|p| p.group == group).collect();
        records.sort_by_key(|p| p.parity_index);
        records
    }

    pub fn posted_articles(&self) -> usize {
        let data = self
            .segments
            .iter()
            .flat_map(|s| s.copies.iter())
            .filter(|c| c.is_posted())
            .count();
        let parity = self
            .parity
            .iter()
            .filter_map(|p| p.article.as_ref())
            .filter(|c| c.is_posted())
            .count();
        data + parity
    }

    pub fn is_fully_posted(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.copies.iter().all(ArticleRef::is_posted))
            && self.parity.iter().all(|p| {
                p.article
                    .as_ref()
                    .map(ArticleRef::is_posted)
                    .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redundancy_mode_validation() {
        assert!(RedundancyMode::None.validate().is_ok());
        assert!(RedundancyMode::UniqueCopies { level: 3 }.validate().is_ok());
        assert!(RedundancyMode::UniqueCopies { level: 0 }.validate().is_err());
        assert!(RedundancyMode::Parity { group_size: 1 }.validate().is_err());
        assert!(RedundancyMode::ReedSolomon {
            data_shards: 200,
            parity_shards: 100
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_redundancy_mode_toml_shape() {
        let mode: RedundancyMode =
            serde_json::from_str(r#"{"mode":"unique_copies","level":3}"#).unwrap();
        assert_eq!(mode, RedundancyMode::UniqueCopies { level: 3 });
        assert_eq!(mode.copies_per_segment(), 3);

        let mode: RedundancyMode = serde_json::from_str(r#"{"mode":"none"}"#).unwrap();
        assert_eq!(mode.copies_per_segment(), 1);
    }
}

use std::path::Path;

use blake3::Hasher;
use tokio::io::AsyncReadExt;

use crate::integrity::error::{IntegrityError, IntegrityResult};
use crate::segment::{FileManifest, RedundancyMode};

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Calculate BLAKE3 checksum for byte slice
    pub fn calculate_checksum(data: &[u8]) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(data);
        *hasher.finalize().as_bytes()
    }

    /// Calculate BLAKE3 checksum for file (streaming)
    pub async fn calculate_file_checksum(path: &Path) -> IntegrityResult<[u8; 32]> {
        let mut file = tokio::fs::File::open(path).await?;

        let mut hasher = Hasher::new();
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(*hasher.finalize().as_bytes())
    }

    pub fn verify_segment(
        segment_index: u32,
        data: &[u8],
        expected: &[u8; 32],
    ) -> IntegrityResult<()> {
        let actual = Self::calculate_checksum(data);
        if &actual != expected {
            return Err(IntegrityError::ChecksumMismatch {
                segment_index,
                expected: *expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn verify_file(file_id: &str, data: &[u8], expected: &[u8; 32]) -> IntegrityResult<()> {
        let actual = Self::calculate_checksum(data);
        if &actual != expected {
            return Err(IntegrityError::FileChecksumMismatch {
                file_id: file_id.to_string(),
                expected: *expected,
                actual,
            });
        }
        Ok(())
    }

    /// Structural checks run before any article is fetched.
    pub fn verify_manifest(manifest: &FileManifest) -> IntegrityResult<()> {
        let invalid = |reason: String| IntegrityError::InvalidManifest {
            file_id: manifest.file_id.clone(),
            reason,
        };

        if manifest.segment_size == 0 {
            return Err(invalid("segment size is zero".into()));
        }
        if manifest.segments.len() != manifest.total_segments as usize {
            return Err(invalid(format!(
                "{} segment records for {} total segments",
                manifest.segments.len(),
                manifest.total_segments
            )));
        }

        let mut offset = 0u64;
        let mut sorted: Vec<_> = manifest.segments.iter().collect();
        sorted.sort_by_key(|s| s.segment_index);
        for (expected_index, record) in sorted.iter().enumerate() {
            if record.segment_index as usize != expected_index {
                return Err(invalid(format!(
                    "segment index {} out of sequence",
                    record.segment_index
                )));
            }
            if record.data_offset != offset {
                return Err(invalid(format!(
                    "segment {} offset {} != expected {offset}",
                    record.segment_index, record.data_offset
                )));
            }
            if record.size > manifest.segment_size {
                return Err(invalid(format!(
                    "segment {} size {} exceeds segment size {}",
                    record.segment_index, record.size, manifest.segment_size
                )));
            }
            offset += record.size as u64;
        }
        if offset != manifest.file_size {
            return Err(invalid(format!(
                "segment sizes sum to {offset}, file size is {}",
                manifest.file_size
            )));
        }

        if let RedundancyMode::UniqueCopies { level } = manifest.redundancy {
            let overfull = manifest
                .segments
                .iter()
                .find(|s| s.copies.len() > level as usize);
            if let Some(record) = overfull {
                return Err(invalid(format!(
                    "segment {} lists {} copies for level {level}",
                    record.segment_index,
                    record.copies.len()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentRecord, SegmentState};
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    fn manifest(sizes: &[usize]) -> FileManifest {
        let mut offset = 0u64;
        let segments = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let record = SegmentRecord {
                    segment_index: i as u32,
                    size,
                    content_hash: [0u8; 32],
                    data_offset: offset,
                    state: SegmentState::Posted,
                    copies: Vec::new(),
                };
                offset += size as u64;
                record
            })
            .collect();
        FileManifest {
            file_id: "file".into(),
            folder_id: "folder".into(),
            file_size: offset,
            file_hash: [0u8; 32],
            segment_size: 10,
            total_segments: sizes.len() as u32,
            redundancy: RedundancyMode::None,
            segments,
            parity: Vec::new(),
            created_at: 0,
            packed_files: Vec::new(),
        }
    }

    #[test]
    fn test_checksum_calculation() {
        let checksum = IntegrityVerifier::calculate_checksum(b"Hello, World!");
        assert_eq!(checksum, IntegrityVerifier::calculate_checksum(b"Hello, World!"));
        assert_ne!(checksum, IntegrityVerifier::calculate_checksum(b"Hello, World?"));
    }

    #[test]
    fn test_verify_segment() {
        let expected = IntegrityVerifier::calculate_checksum(b"data");
        assert!(IntegrityVerifier::verify_segment(3, b"data", &expected).is_ok());
        match IntegrityVerifier::verify_segment(3, b"datb", &expected) {
            Err(IntegrityError::ChecksumMismatch { segment_index, .. }) => {
                assert_eq!(segment_index, 3)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_file_checksum_matches_in_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();

        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(&data).await.unwrap();
        file.flush().await.unwrap();

        let checksum = IntegrityVerifier::calculate_file_checksum(&path).await.unwrap();
        assert_eq!(checksum, IntegrityVerifier::calculate_checksum(&data));
    }

    #[test]
    fn test_manifest_consistency() {
        assert!(IntegrityVerifier::verify_manifest(&manifest(&[10, 10, 3])).is_ok());

        let mut bad = manifest(&[10, 10, 3]);
        bad.file_size = 99;
        assert!(IntegrityVerifier::verify_manifest(&bad).is_err());

        let mut gap = manifest(&[10, 10, 3]);
        gap.segments[1].data_offset = 11;
        assert!(IntegrityVerifier::verify_manifest(&gap).is_err());

        assert!(IntegrityVerifier::verify_manifest(&manifest(&[10, 12])).is_err());
    }
}

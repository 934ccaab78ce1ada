use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::error::TransferResult;
use crate::integrity::{IntegrityError, IntegrityVerifier, SegmentSource, VerificationSummary};
use crate::metrics;
use crate::segment::{recover_segment, ErasureCoder, FileManifest, RedundancyMode, SegmentRecord};

/// Verified segment payloads keyed by segment index, plus how each was
/// obtained.
#[derive(Debug, Default)]
pub struct SegmentSet {
    pub segments: BTreeMap<u32, Bytes>,
    pub sources: BTreeMap<u32, SegmentSource>,
}

impl SegmentSet {
    pub fn insert(&mut self, index: u32, data: Bytes, source: SegmentSource) {
        self.segments.insert(index, data);
        self.sources.insert(index, source);
    }

    pub fn contains(&self, index: u32) -> bool {
        self.segments.contains_key(&index)
    }

    /// Indices of `manifest` segments not in the set, ascending.
    pub fn missing(&self, manifest: &FileManifest) -> Vec<u32> {
        let mut missing: Vec<u32> = manifest
            .segments
            .iter()
            .map(|s| s.segment_index)
            .filter(|i| !self.contains(*i))
            .collect();
        missing.sort_unstable();
        missing
    }
}

/// Rebuilds missing segments from parity and reassembles the file.
pub struct Reconstructor;

impl Reconstructor {
    /// Parity groups that have at least one missing member.
    pub fn groups_needing_parity(manifest: &FileManifest, set: &SegmentSet) -> Vec<u32> {
        let mut groups: Vec<u32> = manifest
            .parity
            .iter()
            .filter(|p| p.members.iter().any(|m| !set.contains(*m)))
            .map(|p| p.group)
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }

    /// Fills in every missing segment the manifest's parity can rebuild.
    ///
    /// `parity` holds verified parity blocks keyed by `(group, parity_index)`.
    /// Each rebuilt segment is checked against its recorded hash before it
    /// is accepted.
    pub fn recover(
        manifest: &FileManifest,
        set: &mut SegmentSet,
        parity: &HashMap<(u32, u32), Bytes>,
    ) -> TransferResult<()> {
        for group in Self::groups_needing_parity(manifest, set) {
            let records = manifest.parity_for_group(group);
            let Some(first) = records.first() else {
                continue;
            };
            let members: Vec<&SegmentRecord> = first
                .members
                .iter()
                .filter_map(|m| manifest.segment(*m))
                .collect();
            let available: Vec<Option<Bytes>> = members
                .iter()
                .map(|r| set.segments.get(&r.segment_index).cloned())
                .collect();
            let missing = available.iter().filter(|a| a.is_none()).count();
            debug!(file_id = %manifest.file_id, group, missing, "Attempting parity recovery");

            let rebuilt = match manifest.redundancy {
                RedundancyMode::Parity { .. } => {
                    let Some(block) = parity.get(&(group, 0)) else {
                        warn!(file_id = %manifest.file_id, group, "Parity block unavailable");
                        continue;
                    };
                    let Some(position) = available.iter().position(Option::is_none) else {
                        continue;
                    };
                    match recover_segment(&available, block, position) {
                        Ok(data) => vec![(position, data, SegmentSource::Parity)],
                        Err(e) => {
                            warn!(
                                file_id = %manifest.file_id,
                                group,
                                error = %e,
                                "XOR recovery failed"
                            );
                            continue;
                        }
                    }
                }
                RedundancyMode::ReedSolomon {
                    data_shards,
                    parity_shards,
                } => {
                    let coder = ErasureCoder::new(data_shards, parity_shards)?;
                    let blocks: Vec<Option<Bytes>> = (0..parity_shards as u32)
                        .map(|i| parity.get(&(group, i)).cloned())
                        .collect();
                    let sizes: Vec<usize> = members.iter().map(|r| r.size).collect();
                    match coder.reconstruct(&available, &blocks, &sizes) {
                        Ok(all) => all
                            .into_iter()
                            .enumerate()
                            .filter(|(pos, _)| available[*pos].is_none())
                            .map(|(pos, data)| (pos, data, SegmentSource::ErasureCode))
                            .collect(),
                        Err(e) => {
                            warn!(
                                file_id = %manifest.file_id,
                                group,
                                error = %e,
                                "Erasure recovery failed"
                            );
                            continue;
                        }
                    }
                }
                RedundancyMode::None | RedundancyMode::UniqueCopies { .. } => continue,
            };

            for (position, mut data, source) in rebuilt {
                let record = members[position];
                // XOR recovery strips trailing zeros; restore the true length
                if data.len() != record.size {
                    let mut padded = BytesMut::from(&data[..data.len().min(record.size)]);
                    padded.resize(record.size, 0);
                    data = padded.freeze();
                }
                match IntegrityVerifier::verify_segment(
                    record.segment_index,
                    &data,
                    &record.content_hash,
                ) {
                    Ok(()) => {
                        info!(
                            file_id = %manifest.file_id,
                            segment = record.segment_index,
                            ?source,
                            "Recovered segment"
                        );
                        metrics::record_segment_recovered(match source {
                            SegmentSource::Parity => "parity",
                            _ => "erasure",
                        });
                        set.insert(record.segment_index, data, source);
                    }
                    Err(e) => {
                        warn!(file_id = %manifest.file_id, error = %e, "Rebuilt segment rejected")
                    }
                }
            }
        }
        Ok(())
    }

    /// Concatenates the segments in index order and checks the file hash.
    pub fn assemble(manifest: &FileManifest, set: &SegmentSet) -> TransferResult<Bytes> {
        let missing = set.missing(manifest);
        if !missing.is_empty() {
            return Err(IntegrityError::Unrecoverable {
                file_id: manifest.file_id.clone(),
                missing,
            }
            .into());
        }

        let mut records: Vec<&SegmentRecord> = manifest.segments.iter().collect();
        records.sort_by_key(|r| r.segment_index);

        let mut out = BytesMut::with_capacity(manifest.file_size as usize);
        for record in records {
            if let Some(data) = set.segments.get(&record.segment_index) {
                out.extend_from_slice(data);
            }
        }
        let data = out.freeze();
        IntegrityVerifier::verify_file(&manifest.file_id, &data, &manifest.file_hash)?;
        Ok(data)
    }

    /// Recovery then assembly, tallying where every segment came from.
    pub fn reconstruct(
        manifest: &FileManifest,
        set: &mut SegmentSet,
        parity: &HashMap<(u32, u32), Bytes>,
    ) -> TransferResult<(Bytes, VerificationSummary)> {
        Self::recover(manifest, set, parity)?;

        let mut summary = VerificationSummary::new(manifest.segments.len());
        for source in set.sources.values() {
            summary.record(*source);
        }
        summary.missing = set.missing(manifest);

        let data = Self::assemble(manifest, set)?;
        Ok((data, summary))
    }
}

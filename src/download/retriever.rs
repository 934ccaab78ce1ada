use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::cache::SegmentCache;
use super::reconstructor::{Reconstructor, SegmentSet};
use crate::codec::{decode_body, SegmentHeader};
use crate::error::{TransferError, TransferResult};
use crate::integrity::{IntegrityVerifier, SegmentSource, VerificationSummary};
use crate::metrics;
use crate::network::Transport;
use crate::segment::{
    extract_original_data, ArticleKind, ArticleRef, FileManifest, ParityRecord, SegmentRecord,
};

/// A reassembled, hash-verified file.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub file_id: String,
    pub data: Bytes,
    pub summary: VerificationSummary,
    /// Where each segment came from, by segment index.
    pub sources: Vec<(u32, SegmentSource)>,
}

/// Segments of one file already verified by an earlier, interrupted pass.
///
/// A resumed download skips every segment recorded here. Failed-copy
/// counts carry over so the final summary covers all passes.
#[derive(Default)]
pub struct DownloadCheckpoint {
    state: Mutex<CheckpointState>,
}

#[derive(Default)]
struct CheckpointState {
    set: SegmentSet,
    failed_copies: usize,
}

impl DownloadCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.state.lock().set.contains(index)
    }

    pub fn verified_count(&self) -> usize {
        self.state.lock().set.segments.len()
    }

    /// Verified segment indices, ascending.
    pub fn verified(&self) -> Vec<u32> {
        self.state.lock().set.segments.keys().copied().collect()
    }

    fn record(&self, index: u32, data: Bytes, source: SegmentSource) {
        self.state.lock().set.insert(index, data, source);
    }

    fn add_failed_copies(&self, failed: usize) {
        self.state.lock().failed_copies += failed;
    }

    /// A copy of the verified segments plus the failed-copy tally.
    fn snapshot(&self) -> (SegmentSet, usize) {
        let state = self.state.lock();
        let set = SegmentSet {
            segments: state.set.segments.clone(),
            sources: state.set.sources.clone(),
        };
        (set, state.failed_copies)
    }

    /// Drops the held segments once the file is written.
    pub fn clear(&self) {
        *self.state.lock() = CheckpointState::default();
    }
}

/// Fetches the articles listed in a manifest and rebuilds the file.
pub struct DownloadRetriever {
    transport: Arc<Transport>,
    concurrency: usize,
    cache: Option<Arc<SegmentCache>>,
}

impl DownloadRetriever {
    pub fn new(transport: Arc<Transport>, concurrency: usize) -> Self {
        Self {
            transport,
            concurrency: concurrency.max(1),
            cache: None,
        }
    }

    /// Serves verified segments from `cache` before going to the network
    /// and stores every segment it verifies there.
    pub fn with_cache(mut self, cache: Arc<SegmentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn cache(&self) -> Option<&Arc<SegmentCache>> {
        self.cache.as_ref()
    }

    /// Fetches every segment, falls back to parity for what is missing or
    /// corrupt, and returns the verified file.
    ///
    /// `should_continue` is polled before each segment fetch.
    /// `on_progress` receives (segments fetched, total segments).
    pub async fn download<C, P>(
        &self,
        manifest: &FileManifest,
        should_continue: C,
        on_progress: P,
    ) -> TransferResult<DownloadReport>
    where
        C: Fn() -> bool,
        P: Fn(usize, usize),
    {
        self.download_resumable(manifest, &DownloadCheckpoint::new(), should_continue, on_progress)
            .await
    }

    /// Like [`download`](Self::download), but skips the segments already in
    /// `checkpoint` and records each newly verified one there, so a pass
    /// that returns `Interrupted` can be resumed without refetching.
    pub async fn download_resumable<'m, C, P>(
        &self,
        manifest: &'m FileManifest,
        checkpoint: &DownloadCheckpoint,
        should_continue: C,
        on_progress: P,
    ) -> TransferResult<DownloadReport>
    where
        C: Fn() -> bool,
        P: Fn(usize, usize),
    {
        IntegrityVerifier::verify_manifest(manifest)?;
        let total = manifest.segments.len();
        let pending: Vec<&SegmentRecord> = manifest
            .segments
            .iter()
            .filter(|r| !checkpoint.contains(r.segment_index))
            .collect();
        info!(
            file_id = %manifest.file_id,
            segments = total,
            resumed = total - pending.len(),
            "Downloading"
        );

        let should_continue = &should_continue;
        let fetches: Vec<_> = pending
            .into_iter()
            .map(|record: &'m SegmentRecord| async move {
                if !should_continue() {
                    return (record.segment_index, None);
                }
                (record.segment_index, Some(self.fetch_segment(manifest, record).await))
            })
            .collect();
        let mut results = stream::iter(fetches).buffer_unordered(self.concurrency);

        let mut interrupted = false;
        let mut done = checkpoint.verified_count();
        while let Some((index, result)) = results.next().await {
            let Some((found, failed)) = result else {
                interrupted = true;
                continue;
            };
            checkpoint.add_failed_copies(failed);
            match found {
                Some((data, source)) => {
                    checkpoint.record(index, data, source);
                    done += 1;
                    on_progress(done, total);
                }
                None => warn!(file_id = %manifest.file_id, segment = index, "No usable copy"),
            }
        }
        if interrupted {
            info!(
                file_id = %manifest.file_id,
                verified = checkpoint.verified_count(),
                total,
                "Download interrupted, checkpoint kept"
            );
            return Err(TransferError::Interrupted(manifest.file_id.clone()));
        }
        let (mut set, failed_copies) = checkpoint.snapshot();

        let groups = Reconstructor::groups_needing_parity(manifest, &set);
        let parity = self.fetch_parity(manifest, &groups).await;

        let (data, mut summary) = Reconstructor::reconstruct(manifest, &mut set, &parity)?;
        summary.failed_copies = failed_copies;
        if let Some(cache) = &self.cache {
            for (index, source) in &set.sources {
                if !matches!(source, SegmentSource::Parity | SegmentSource::ErasureCode) {
                    continue;
                }
                if let (Some(record), Some(bytes)) =
                    (manifest.segment(*index), set.segments.get(index))
                {
                    cache.put(record.content_hash, bytes.clone());
                }
            }
        }
        on_progress(total, total);
        info!(
            file_id = %manifest.file_id,
            bytes = data.len(),
            recovered = summary.recovered,
            "Download verified"
        );

        Ok(DownloadReport {
            file_id: manifest.file_id.clone(),
            data,
            summary,
            sources: set.sources.into_iter().collect(),
        })
    }

    /// First copy of the segment that decodes and matches its hash, tried
    /// in redundancy order, and the number of copies that were unusable.
    async fn fetch_segment(
        &self,
        manifest: &FileManifest,
        record: &SegmentRecord,
    ) -> (Option<(Bytes, SegmentSource)>, usize) {
        if let Some(data) = self.cache.as_ref().and_then(|c| c.get(&record.content_hash)) {
            debug!(segment = record.segment_index, "Served from cache");
            return (Some((data, SegmentSource::Cache)), 0);
        }

        let mut copies: Vec<&ArticleRef> = record.copies.iter().collect();
        copies.sort_by_key(|c| c.redundancy_index);

        let mut failed = 0;
        for copy in copies {
            let body = match self.transport.fetch(&copy.message_id).await {
                Ok(body) => body,
                Err(e) => {
                    debug!(
                        segment = record.segment_index,
                        copy = copy.redundancy_index,
                        error = %e,
                        "Copy unavailable"
                    );
                    failed += 1;
                    continue;
                }
            };
            match decode_copy(manifest, record, copy, &body) {
                Ok(data) => {
                    if copy.redundancy_index > 0 {
                        metrics::record_segment_recovered("copy");
                    }
                    if let Some(cache) = &self.cache {
                        cache.put(record.content_hash, data.clone());
                    }
                    let source = SegmentSource::Copy {
                        redundancy_index: copy.redundancy_index,
                    };
                    return (Some((data, source)), failed);
                }
                Err(reason) => {
                    warn!(
                        file_id = %manifest.file_id,
                        segment = record.segment_index,
                        copy = copy.redundancy_index,
                        reason = %reason,
                        "Discarding copy"
                    );
                    failed += 1;
                }
            }
        }
        (None, failed)
    }

    /// Verified parity blocks for `groups`, keyed by `(group, parity_index)`.
    /// Blocks that cannot be fetched or fail their hash are left out.
    pub async fn fetch_parity<'m>(
        &self,
        manifest: &'m FileManifest,
        groups: &[u32],
    ) -> HashMap<(u32, u32), Bytes> {
        let wanted: Vec<&ParityRecord> = manifest
            .parity
            .iter()
            .filter(|p| groups.contains(&p.group))
            .collect();
        if wanted.is_empty() {
            return HashMap::new();
        }
        debug!(file_id = %manifest.file_id, blocks = wanted.len(), "Fetching parity");

        let fetches: Vec<_> = wanted
            .into_iter()
            .map(|record: &'m ParityRecord| async move {
                let article = record.article.as_ref()?;
                let body = match self.transport.fetch(&article.message_id).await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(group = record.group, error = %e, "Parity unavailable");
                        return None;
                    }
                };
                match decode_parity(manifest, record, &body) {
                    Ok(block) => Some(((record.group, record.parity_index), block)),
                    Err(reason) => {
                        warn!(group = record.group, reason = %reason, "Discarding parity block");
                        None
                    }
                }
            })
            .collect();
        stream::iter(fetches)
            .buffer_unordered(self.concurrency)
            .filter_map(|entry| async move { entry })
            .collect()
            .await
    }
}

fn check_header(
    header: &SegmentHeader,
    manifest: &FileManifest,
    kind: ArticleKind,
    index: u32,
) -> Result<(), String> {
    if header.file_id != manifest.file_id {
        return Err(format!("belongs to file {}", header.file_id));
    }
    if header.segment_index != index {
        return Err(format!("carries index {}", header.segment_index));
    }
    let found = header.meta_str("kind").and_then(ArticleKind::parse);
    if found != Some(kind) {
        return Err(format!("kind {:?} where {} was expected", found, kind.as_str()));
    }
    Ok(())
}

fn decode_copy(
    manifest: &FileManifest,
    record: &SegmentRecord,
    copy: &ArticleRef,
    body: &[u8],
) -> Result<Bytes, String> {
    let (header, payload) = decode_body(body).map_err(|e| e.to_string())?;
    check_header(&header, manifest, ArticleKind::Data, record.segment_index)?;
    let data = if header.meta_u64("redundancy_index").unwrap_or(0) > 0 {
        extract_original_data(&payload)
    } else {
        payload
    };
    IntegrityVerifier::verify_segment(record.segment_index, &data, &record.content_hash)
        .map_err(|e| e.to_string())?;
    debug!(segment = record.segment_index, copy = copy.redundancy_index, "Copy verified");
    Ok(data)
}

fn decode_parity(
    manifest: &FileManifest,
    record: &ParityRecord,
    body: &[u8],
) -> Result<Bytes, String> {
    let (header, payload) = decode_body(body).map_err(|e| e.to_string())?;
    check_header(&header, manifest, ArticleKind::Parity, record.group)?;
    if header.meta_u64("parity_index") != Some(u64::from(record.parity_index)) {
        return Err("parity index mismatch".into());
    }
    let actual = IntegrityVerifier::calculate_checksum(&payload);
    if actual != record.content_hash {
        return Err("parity block hash mismatch".into());
    }
    Ok(payload)
}

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::codec::{encode_body, Article, ObfuscatedIdentity, ObfuscationCodec, SegmentHeader};
use crate::config::Config;
use crate::error::{TransferError, TransferResult};
use crate::integrity::IntegrityVerifier;
use crate::network::{NetworkResult, PostReceipt, Transport};
use crate::segment::{
    calculate_parity, ArticleKind, ArticleRef, ErasureCoder, FileManifest, ParityRecord,
    RedundancyEngine, RedundancyMode, SegmentRecord, SegmentState, Segmenter,
};

/// Per-job knobs, normally taken from [`Config`].
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub segment_size: usize,
    pub line_length: usize,
    pub newsgroups: Vec<String>,
    pub redundancy: RedundancyMode,
    pub segment_concurrency: usize,
}

impl UploadOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            segment_size: config.pipeline.segment_size,
            line_length: config.pipeline.line_length,
            newsgroups: config.pipeline.newsgroups.clone(),
            redundancy: config.pipeline.redundancy_mode(),
            segment_concurrency: config.workers.segment_concurrency,
        }
    }
}

/// One article that could not be posted.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleFailure {
    pub kind: ArticleKind,
    /// Segment index for data articles, group number for parity.
    pub index: u32,
    /// Copy index for data articles, parity index for parity.
    pub redundancy_index: u32,
    pub error: String,
}

impl fmt::Display for ArticleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ArticleKind::Data => write!(
                f,
                "segment {} copy {}: {}",
                self.index, self.redundancy_index, self.error
            ),
            ArticleKind::Parity => write!(
                f,
                "parity group {} block {}: {}",
                self.index, self.redundancy_index, self.error
            ),
        }
    }
}

/// What one `post` pass did.
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub file_id: String,
    pub articles_total: usize,
    /// Posted by this pass.
    pub posted: usize,
    /// Already posted by an earlier pass.
    pub skipped: usize,
    pub failures: Vec<ArticleFailure>,
    /// Stopped early because the job was paused or cancelled.
    pub interrupted: bool,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.failures.is_empty()
    }

    /// Human-readable summary of the failures, for a queue item's message.
    pub fn error_message(&self) -> Option<String> {
        let first = self.failures.first()?;
        let mut message = format!(
            "{} of {} articles failed; {}",
            self.failures.len(),
            self.articles_total,
            first
        );
        if self.failures.len() > 1 {
            message.push_str(&format!(" (and {} more)", self.failures.len() - 1));
        }
        Some(message)
    }

    pub fn into_result(self) -> TransferResult<Self> {
        if self.interrupted {
            return Err(TransferError::Interrupted(self.file_id));
        }
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(TransferError::ArticlesFailed {
                file_id: self.file_id.clone(),
                failed: self.failures.len(),
                total: self.articles_total,
                first_error: first.to_string(),
            }),
        }
    }
}

/// Where a posting task sits in the manifest.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Copy { record: usize, copy: usize },
    Parity { record: usize },
}

struct PostTask {
    slot: Slot,
    identity: ObfuscatedIdentity,
    header: SegmentHeader,
    payload: Bytes,
}

/// Segment -> redundancy -> header -> yEnc -> post.
pub struct UploadPipeline {
    segmenter: Segmenter,
    engine: RedundancyEngine,
    transport: Arc<Transport>,
    options: UploadOptions,
}

impl UploadPipeline {
    pub fn new(
        codec: Arc<ObfuscationCodec>,
        transport: Arc<Transport>,
        options: UploadOptions,
    ) -> TransferResult<Self> {
        options.redundancy.validate()?;
        Ok(Self {
            segmenter: Segmenter::new(options.segment_size)?,
            engine: RedundancyEngine::new(codec),
            transport,
            options,
        })
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Segments `data` and assigns every article its identity. Nothing is
    /// posted yet; every article starts out pending.
    pub fn prepare(
        &self,
        file_id: &str,
        folder_id: &str,
        data: &Bytes,
    ) -> TransferResult<FileManifest> {
        let codec = self.engine.codec();
        let redundancy = self.options.redundancy;
        let segments = self.segmenter.segment_bytes(file_id, data)?;
        let total_segments = segments.len() as u32;

        let records: Vec<SegmentRecord> = segments
            .iter()
            .map(|segment| SegmentRecord {
                segment_index: segment.segment_index,
                size: segment.size,
                content_hash: segment.content_hash,
                data_offset: segment.data_offset,
                state: SegmentState::Pending,
                copies: (0..redundancy.copies_per_segment())
                    .map(|r| {
                        let identity = codec.identity(folder_id, segment.segment_index, r);
                        ArticleRef::pending(r, &identity)
                    })
                    .collect(),
            })
            .collect();

        let mut parity = Vec::new();
        let parity_folder = format!("{folder_id}/parity");
        for (group, blocks) in self
            .parity_blocks(file_id, &records, data)?
            .into_iter()
            .enumerate()
        {
            let group = group as u32;
            let members = group_members(&records, redundancy, group);
            for (parity_index, block) in blocks.iter().enumerate() {
                let parity_index = parity_index as u32;
                parity.push(ParityRecord {
                    group,
                    parity_index,
                    members: members.clone(),
                    size: block.len(),
                    content_hash: IntegrityVerifier::calculate_checksum(block),
                    article: Some(ArticleRef::pending(
                        parity_index,
                        &codec.identity(&parity_folder, group, parity_index),
                    )),
                });
            }
        }

        let manifest = FileManifest {
            file_id: file_id.to_string(),
            folder_id: folder_id.to_string(),
            file_size: data.len() as u64,
            file_hash: IntegrityVerifier::calculate_checksum(data),
            segment_size: self.options.segment_size,
            total_segments,
            redundancy,
            segments: records,
            parity,
            created_at: chrono::Utc::now().timestamp(),
            packed_files: Vec::new(),
        };
        info!(
            file_id,
            segments = total_segments,
            articles = manifest.segments.iter().map(|s| s.copies.len()).sum::<usize>()
                + manifest.parity.len(),
            mode = ?redundancy,
            "Prepared upload"
        );
        Ok(manifest)
    }

    /// Parity blocks per group, in group order. Empty for modes without
    /// parity. Deterministic for the same data.
    fn parity_blocks(
        &self,
        file_id: &str,
        records: &[SegmentRecord],
        data: &Bytes,
    ) -> TransferResult<Vec<Vec<Bytes>>> {
        let redundancy = self.options.redundancy;
        let Some(group_size) = redundancy.group_size() else {
            return Ok(Vec::new());
        };
        let coder = match redundancy {
            RedundancyMode::ReedSolomon {
                data_shards,
                parity_shards,
            } => Some(ErasureCoder::new(data_shards, parity_shards)?),
            _ => None,
        };

        records
            .chunks(group_size)
            .map(|group| {
                let members = group
                    .iter()
                    .map(|r| slice_of(file_id, data, r))
                    .collect::<TransferResult<Vec<Bytes>>>()?;
                match &coder {
                    Some(coder) => Ok(coder.parity(&members)?),
                    None => Ok(vec![calculate_parity(&members)]),
                }
            })
            .collect()
    }

    /// Posts every article of `manifest` that is not posted yet and records
    /// the outcome in place.
    ///
    /// `should_continue` is polled before each article is started; once it
    /// returns false no further article starts and in-flight ones finish.
    /// `on_progress` receives (posted articles, total articles).
    pub async fn post<C, P>(
        &self,
        manifest: &mut FileManifest,
        data: &Bytes,
        should_continue: C,
        on_progress: P,
    ) -> TransferResult<UploadReport>
    where
        C: Fn() -> bool,
        P: Fn(usize, usize),
    {
        if data.len() as u64 != manifest.file_size {
            return Err(crate::integrity::IntegrityError::InvalidManifest {
                file_id: manifest.file_id.clone(),
                reason: format!(
                    "{} bytes supplied for a {} byte file",
                    data.len(),
                    manifest.file_size
                ),
            }
            .into());
        }

        let tasks = self.pending_tasks(manifest, data)?;
        let articles_total = manifest.segments.iter().map(|s| s.copies.len()).sum::<usize>()
            + manifest.parity.len();
        let mut report = UploadReport {
            file_id: manifest.file_id.clone(),
            articles_total,
            skipped: manifest.posted_articles(),
            ..UploadReport::default()
        };
        debug!(
            file_id = %manifest.file_id,
            pending = tasks.len(),
            skipped = report.skipped,
            "Posting articles"
        );

        let should_continue = &should_continue;
        let mut results = stream::iter(tasks)
            .map(|task| async move {
                if !should_continue() {
                    return (task.slot, None);
                }
                let result = self.post_task(&task).await;
                (task.slot, Some(result))
            })
            .buffer_unordered(self.options.segment_concurrency.max(1));

        let mut done = report.skipped;
        while let Some((slot, result)) = results.next().await {
            let Some(result) = result else {
                report.interrupted = true;
                continue;
            };
            let article = article_at(manifest, slot);
            match result {
                Ok(receipt) => {
                    article.state = SegmentState::Posted;
                    article.server = Some(receipt.server.to_string());
                    report.posted += 1;
                    done += 1;
                    on_progress(done, articles_total);
                }
                Err(e) => {
                    article.state = SegmentState::Failed;
                    let failure = failure_at(manifest, slot, e.to_string());
                    warn!(file_id = %manifest.file_id, "Article failed: {failure}");
                    report.failures.push(failure);
                }
            }
        }

        for record in &mut manifest.segments {
            record.state = segment_state(&record.copies);
        }

        info!(
            file_id = %manifest.file_id,
            posted = report.posted,
            skipped = report.skipped,
            failed = report.failures.len(),
            interrupted = report.interrupted,
            "Upload pass finished"
        );
        Ok(report)
    }

    /// Prepares and posts `data` in one go, failing if any article failed.
    pub async fn upload(
        &self,
        file_id: &str,
        folder_id: &str,
        data: &Bytes,
    ) -> TransferResult<(FileManifest, UploadReport)> {
        let mut manifest = self.prepare(file_id, folder_id, data)?;
        let report = self.post(&mut manifest, data, || true, |_, _| {}).await?;
        Ok((manifest, report.into_result()?))
    }

    fn pending_tasks(
        &self,
        manifest: &FileManifest,
        data: &Bytes,
    ) -> TransferResult<Vec<PostTask>> {
        let mut tasks = Vec::new();
        for (record_pos, record) in manifest.segments.iter().enumerate() {
            let chunk = slice_of(&manifest.file_id, data, record)?;
            for (copy_pos, copy) in record.copies.iter().enumerate() {
                if copy.is_posted() {
                    continue;
                }
                let header = SegmentHeader::new(
                    record.segment_index,
                    manifest.total_segments,
                    &manifest.file_id,
                    manifest.file_size,
                )
                .with_meta("kind", ArticleKind::Data.as_str())
                .with_meta("redundancy_index", copy.redundancy_index);
                tasks.push(PostTask {
                    slot: Slot::Copy {
                        record: record_pos,
                        copy: copy_pos,
                    },
                    identity: copy.identity(),
                    header,
                    payload: self.engine.variant(
                        &chunk,
                        record.segment_index,
                        copy.redundancy_index,
                    ),
                });
            }
        }

        let unposted: Vec<usize> = manifest
            .parity
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.article.as_ref().map(ArticleRef::is_posted).unwrap_or(false))
            .map(|(pos, _)| pos)
            .collect();
        if unposted.is_empty() {
            return Ok(tasks);
        }

        let blocks = self.parity_blocks(&manifest.file_id, &manifest.segments, data)?;
        for pos in unposted {
            let record = &manifest.parity[pos];
            let Some(article) = &record.article else {
                continue;
            };
            let block = blocks
                .get(record.group as usize)
                .and_then(|group| group.get(record.parity_index as usize))
                .cloned()
                .ok_or_else(|| crate::integrity::IntegrityError::InvalidManifest {
                    file_id: manifest.file_id.clone(),
                    reason: format!(
                        "parity group {} block {} does not match the data",
                        record.group, record.parity_index
                    ),
                })?;
            let header = SegmentHeader::new(
                record.group,
                manifest.total_segments,
                &manifest.file_id,
                manifest.file_size,
            )
            .with_meta("kind", ArticleKind::Parity.as_str())
            .with_meta("group", record.group)
            .with_meta("parity_index", record.parity_index);
            tasks.push(PostTask {
                slot: Slot::Parity { record: pos },
                identity: article.identity(),
                header,
                payload: block,
            });
        }
        Ok(tasks)
    }

    async fn post_task(&self, task: &PostTask) -> NetworkResult<PostReceipt> {
        let body = encode_body(&task.header, &task.payload, self.options.line_length)
            .map_err(|e| crate::network::NetworkError::Protocol(e.to_string()))?;
        let article = Article::for_post(&task.identity, &self.options.newsgroups, body);
        self.transport.post(&article).await
    }
}

/// The bytes `record` covers, or an error if the record points outside `data`.
fn slice_of(file_id: &str, data: &Bytes, record: &SegmentRecord) -> TransferResult<Bytes> {
    let range = usize::try_from(record.data_offset)
        .ok()
        .and_then(|start| Some(start..start.checked_add(record.size)?))
        .filter(|range| range.end <= data.len());
    match range {
        Some(range) => Ok(data.slice(range)),
        None => Err(crate::integrity::IntegrityError::InvalidManifest {
            file_id: file_id.to_string(),
            reason: format!(
                "segment {} covers {} bytes at offset {} of a {} byte buffer",
                record.segment_index,
                record.size,
                record.data_offset,
                data.len()
            ),
        }
        .into()),
    }
}

fn group_members(records: &[SegmentRecord], redundancy: RedundancyMode, group: u32) -> Vec<u32> {
    let group_size = redundancy.group_size().unwrap_or(records.len()).max(1);
    records
        .chunks(group_size)
        .nth(group as usize)
        .map(|chunk| chunk.iter().map(|r| r.segment_index).collect())
        .unwrap_or_default()
}

fn article_at(manifest: &mut FileManifest, slot: Slot) -> &mut ArticleRef {
    match slot {
        Slot::Copy { record, copy } => &mut manifest.segments[record].copies[copy],
        // parity tasks are only built for records that carry an article
        Slot::Parity { record } => match manifest.parity[record].article.as_mut() {
            Some(article) => article,
            None => unreachable!("parity task without an article"),
        },
    }
}

fn failure_at(manifest: &FileManifest, slot: Slot, error: String) -> ArticleFailure {
    match slot {
        Slot::Copy { record, copy } => {
            let record = &manifest.segments[record];
            ArticleFailure {
                kind: ArticleKind::Data,
                index: record.segment_index,
                redundancy_index: record.copies[copy].redundancy_index,
                error,
            }
        }
        Slot::Parity { record } => {
            let record = &manifest.parity[record];
            ArticleFailure {
                kind: ArticleKind::Parity,
                index: record.group,
                redundancy_index: record.parity_index,
                error,
            }
        }
    }
}

/// Posted once every copy is; failed if any copy failed.
fn segment_state(copies: &[ArticleRef]) -> SegmentState {
    if copies.iter().any(|c| c.state == SegmentState::Failed) {
        SegmentState::Failed
    } else if copies.iter().all(ArticleRef::is_posted) {
        SegmentState::Posted
    } else {
        SegmentState::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_body;
    use crate::network::{
        ConnectionPool, MemoryConnector, MemoryNewsServer, RetryPolicy, ServerConfig,
        ServerHealthTracker,
    };
    use crate::segment::extract_original_data;
    use std::cell::Cell;
    use std::time::Duration;

    fn pipeline(backend: Arc<MemoryNewsServer>, redundancy: RedundancyMode) -> UploadPipeline {
        let config = ServerConfig::new("mem", 119);
        let connector = MemoryConnector::single(&config, backend);
        let pool = ConnectionPool::new(
            vec![config],
            4,
            Duration::from_secs(1),
            Arc::new(connector),
            Arc::new(ServerHealthTracker::new()),
        );
        let retry = RetryPolicy {
            max_retries: 1,
            base_delay: 0.001,
            max_delay: 0.01,
            exponential_base: 2.0,
            jitter: false,
        };
        let transport = Arc::new(Transport::unthrottled(Arc::new(pool), retry));
        let codec = Arc::new(ObfuscationCodec::new(b"pipeline-secret").unwrap());
        UploadPipeline::new(
            codec,
            transport,
            UploadOptions {
                segment_size: 1000,
                line_length: 128,
                newsgroups: vec!["alt.binaries.test".into()],
                redundancy,
                segment_concurrency: 4,
            },
        )
        .unwrap()
    }

    fn data(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn test_prepare_layout() {
        let backend = MemoryNewsServer::new();
        let p = pipeline(backend, RedundancyMode::UniqueCopies { level: 2 });
        let manifest = p.prepare("file-1", "folder-1", &data(3500)).unwrap();

        assert_eq!(manifest.total_segments, 4);
        assert_eq!(manifest.segments[3].size, 500);
        assert!(manifest.segments.iter().all(|s| s.copies.len() == 2));
        assert!(manifest.parity.is_empty());
        IntegrityVerifier::verify_manifest(&manifest).unwrap();

        let ids: std::collections::HashSet<_> = manifest
            .segments
            .iter()
            .flat_map(|s| s.copies.iter().map(|c| c.message_id.clone()))
            .collect();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_prepare_parity_groups() {
        let backend = MemoryNewsServer::new();
        let p = pipeline(backend, RedundancyMode::Parity { group_size: 3 });
        let manifest = p.prepare("file-1", "folder-1", &data(7000)).unwrap();

        assert_eq!(manifest.parity.len(), 3);
        assert_eq!(manifest.parity[0].members, vec![0, 1, 2]);
        assert_eq!(manifest.parity[2].members, vec![6]);

        let p = pipeline(
            MemoryNewsServer::new(),
            RedundancyMode::ReedSolomon {
                data_shards: 4,
                parity_shards: 2,
            },
        );
        let manifest = p.prepare("file-2", "folder-1", &data(7000)).unwrap();
        assert_eq!(manifest.parity.len(), 4);
        assert_eq!(manifest.parity_for_group(1).len(), 2);
    }

    #[tokio::test]
    async fn test_post_all_copies() {
        let backend = MemoryNewsServer::new();
        let p = pipeline(backend.clone(), RedundancyMode::UniqueCopies { level: 3 });
        let data = data(2500);
        let (manifest, report) = p.upload("file-1", "folder-1", &data).await.unwrap();

        assert_eq!(report.posted, 9);
        assert!(manifest.is_fully_posted());
        assert_eq!(backend.article_count(), 9);
        assert!(manifest
            .segments
            .iter()
            .all(|s| s.state == SegmentState::Posted));

        // Every copy decodes back to the segment and bodies differ per copy
        let record = &manifest.segments[1];
        let mut bodies = Vec::new();
        for copy in &record.copies {
            let article = backend.article(&copy.message_id).unwrap();
            assert_eq!(article.header("Subject"), Some(copy.wire_subject.as_str()));
            let (header, payload) = decode_body(&article.body).unwrap();
            assert_eq!(header.segment_index, 1);
            assert_eq!(header.meta_u64("redundancy_index"), Some(copy.redundancy_index as u64));
            let original = extract_original_data(&payload);
            assert_eq!(
                IntegrityVerifier::calculate_checksum(&original),
                record.content_hash
            );
            bodies.push(payload);
        }
        assert_ne!(bodies[0], bodies[1]);
        assert_ne!(bodies[1], bodies[2]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let backend = MemoryNewsServer::new();
        backend.reject_posts(true);
        let p = pipeline(backend.clone(), RedundancyMode::None);
        let data = data(3000);
        let mut manifest = p.prepare("file-1", "folder-1", &data).unwrap();
        let report = p.post(&mut manifest, &data, || true, |_, _| {}).await.unwrap();

        assert_eq!(report.failures.len(), 3);
        assert!(report.error_message().unwrap().starts_with("3 of 3 articles failed"));
        assert!(manifest
            .segments
            .iter()
            .all(|s| s.state == SegmentState::Failed));

        // A second pass retries only what failed
        backend.reject_posts(false);
        let report = p.post(&mut manifest, &data, || true, |_, _| {}).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.posted, 3);
        assert!(manifest.is_fully_posted());
    }

    #[tokio::test]
    async fn test_interrupt_and_resume() {
        let backend = MemoryNewsServer::new();
        let p = pipeline(backend.clone(), RedundancyMode::None);
        let data = data(10_000);
        let mut manifest = p.prepare("file-1", "folder-1", &data).unwrap();

        let budget = Cell::new(4usize);
        let report = p
            .post(
                &mut manifest,
                &data,
                || {
                    let left = budget.get();
                    budget.set(left.saturating_sub(1));
                    left > 0
                },
                |_, _| {},
            )
            .await
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.posted, 4);
        assert!(matches!(
            report.into_result(),
            Err(TransferError::Interrupted(_))
        ));

        let progress = Cell::new((0, 0));
        let report = p
            .post(&mut manifest, &data, || true, |done, total| progress.set((done, total)))
            .await
            .unwrap();
        assert_eq!(report.skipped, 4);
        assert_eq!(report.posted, 6);
        assert_eq!(progress.get(), (10, 10));
        assert_eq!(backend.post_count(), 10);
    }

    #[tokio::test]
    async fn test_record_outside_data_is_rejected() {
        let backend = MemoryNewsServer::new();
        let p = pipeline(backend.clone(), RedundancyMode::Parity { group_size: 2 });
        let data = data(2500);
        let mut manifest = p.prepare("file-1", "folder-1", &data).unwrap();
        manifest.segments[2].data_offset = 2400;

        let result = p.post(&mut manifest, &data, || true, |_, _| {}).await;
        assert!(matches!(
            result,
            Err(TransferError::Integrity(
                crate::integrity::IntegrityError::InvalidManifest { .. }
            ))
        ));
        assert_eq!(backend.post_count(), 0);
    }

    #[tokio::test]
    async fn test_parity_articles_posted() {
        let backend = MemoryNewsServer::new();
        let p = pipeline(
            backend.clone(),
            RedundancyMode::ReedSolomon {
                data_shards: 3,
                parity_shards: 2,
            },
        );
        let data = data(4500);
        let (manifest, _) = p.upload("file-1", "folder-1", &data).await.unwrap();

        assert_eq!(backend.article_count(), 5 + 4);
        let parity = &manifest.parity[1];
        let article = backend
            .article(&parity.article.as_ref().unwrap().message_id)
            .unwrap();
        let (header, payload) = decode_body(&article.body).unwrap();
        assert_eq!(header.meta_str("kind"), Some("parity"));
        assert_eq!(header.meta_u64("parity_index"), Some(1));
        assert_eq!(
            IntegrityVerifier::calculate_checksum(&payload),
            parity.content_hash
        );
    }
}

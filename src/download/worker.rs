use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::retriever::{DownloadCheckpoint, DownloadReport, DownloadRetriever};
use crate::error::{TransferError, TransferResult};
use crate::integrity::SegmentSource;
use crate::queue::{JobControl, JobOutcome, JobRunner, QueueItem};
use crate::segment::{unpack, FileManifest, SegmentState};
use crate::store::SqliteStore;

/// One file to fetch and write to `output`. For a packed bundle `output`
/// is the directory its members are written into.
///
/// Segments verified before a pause stay in `checkpoint`, so a resumed
/// run fetches only the rest.
pub struct DownloadJob {
    pub manifest: FileManifest,
    pub output: PathBuf,
    pub checkpoint: DownloadCheckpoint,
}

impl DownloadJob {
    pub fn new(manifest: FileManifest, output: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            output: output.into(),
            checkpoint: DownloadCheckpoint::new(),
        }
    }
}

pub struct DownloadRunner {
    retriever: Arc<DownloadRetriever>,
    store: Option<SqliteStore>,
}

impl DownloadRunner {
    pub fn new(retriever: Arc<DownloadRetriever>, store: Option<SqliteStore>) -> Self {
        Self { retriever, store }
    }

    /// Marks the copies that verified so later runs know they are good.
    async fn record_verified(&self, report: &DownloadReport) {
        let Some(store) = &self.store else {
            return;
        };
        for (segment_index, source) in &report.sources {
            if let SegmentSource::Copy { redundancy_index } = source {
                let result = store
                    .update_segment_state(
                        &report.file_id,
                        *segment_index,
                        *redundancy_index,
                        SegmentState::Verified,
                    )
                    .await;
                if let Err(e) = result {
                    warn!(
                        file_id = %report.file_id,
                        segment = segment_index,
                        error = %e,
                        "Could not record verification"
                    );
                }
            }
        }
    }
}

/// Writes `data` to `path`, creating parent directories.
pub async fn write_output(path: &Path, data: &[u8]) -> TransferResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// Writes every member of a packed bundle into `dir`. Member names are
/// reduced to their final path component.
pub async fn write_unpacked(dir: &Path, data: &Bytes) -> TransferResult<usize> {
    let members = unpack(data)?;
    tokio::fs::create_dir_all(dir).await?;
    for (name, member) in &members {
        let file_name = Path::new(name).file_name().ok_or_else(|| {
            TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("packed member has no file name: {name:?}"),
            ))
        })?;
        tokio::fs::write(dir.join(file_name), member).await?;
        debug!(member = %name, bytes = member.len(), "Unpacked member");
    }
    Ok(members.len())
}

#[async_trait]
impl JobRunner<DownloadJob> for DownloadRunner {
    async fn run(
        &self,
        item: &QueueItem,
        job: Arc<DownloadJob>,
        control: &JobControl<DownloadJob>,
    ) -> JobOutcome {
        let result = self
            .retriever
            .download_resumable(
                &job.manifest,
                &job.checkpoint,
                || control.should_continue(),
                |done, total| control.report_progress(done, total),
            )
            .await;

        let report = match result {
            Ok(report) => report,
            Err(TransferError::Interrupted(_)) => return JobOutcome::Interrupted,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        let written = if job.manifest.is_packed() {
            write_unpacked(&job.output, &report.data).await.map(|_| ())
        } else {
            write_output(&job.output, &report.data).await
        };
        if let Err(e) = written {
            return JobOutcome::Failed(e.to_string());
        }
        job.checkpoint.clear();
        self.record_verified(&report).await;

        info!(
            queue_id = %item.queue_id,
            output = %job.output.display(),
            bytes = report.data.len(),
            "Download written"
        );
        JobOutcome::Completed
    }

    async fn finished(&self, _item: &QueueItem) {
        if let Some(store) = &self.store {
            let snapshot = self.retriever.transport().pool().health().snapshot();
            if let Err(e) = store.save_health_snapshot(&snapshot).await {
                warn!(error = %e, "Failed to save server health");
            }
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::pipeline::UploadPipeline;
use crate::queue::{JobControl, JobOutcome, JobRunner, QueueItem};
use crate::segment::{FileManifest, PackEntry, PackedBundle};
use crate::store::SqliteStore;

/// One file waiting to be posted. The manifest is checkpointed after every
/// pass, so a resumed job only posts what is still missing.
pub struct UploadJob {
    pub file_id: String,
    pub folder_id: String,
    pub data: Bytes,
    /// Non-empty when `data` is a packed bundle of small files.
    pub packed_files: Vec<PackEntry>,
    manifest: Mutex<Option<FileManifest>>,
}

impl UploadJob {
    pub fn new(file_id: impl Into<String>, folder_id: impl Into<String>, data: Bytes) -> Self {
        Self {
            file_id: file_id.into(),
            folder_id: folder_id.into(),
            data,
            packed_files: Vec::new(),
            manifest: Mutex::new(None),
        }
    }

    /// Uploads a bundle under its pack id.
    pub fn bundle(folder_id: impl Into<String>, bundle: PackedBundle) -> Self {
        Self {
            file_id: bundle.pack_id,
            folder_id: folder_id.into(),
            data: bundle.data,
            packed_files: bundle.entries,
            manifest: Mutex::new(None),
        }
    }

    /// Resumes from a manifest saved by an earlier run.
    pub fn resume(manifest: FileManifest, data: Bytes) -> Self {
        Self {
            file_id: manifest.file_id.clone(),
            folder_id: manifest.folder_id.clone(),
            data,
            packed_files: manifest.packed_files.clone(),
            manifest: Mutex::new(Some(manifest)),
        }
    }

    /// The latest checkpoint, if the job has started.
    pub fn manifest(&self) -> Option<FileManifest> {
        self.manifest.lock().clone()
    }
}

pub struct UploadRunner {
    pipeline: Arc<UploadPipeline>,
    store: Option<SqliteStore>,
}

impl UploadRunner {
    pub fn new(pipeline: Arc<UploadPipeline>, store: Option<SqliteStore>) -> Self {
        Self { pipeline, store }
    }

    async fn checkpoint(&self, manifest: &FileManifest) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_manifest(manifest).await {
                warn!(file_id = %manifest.file_id, error = %e, "Failed to checkpoint manifest");
            }
        }
    }
}

#[async_trait]
impl JobRunner<UploadJob> for UploadRunner {
    async fn run(
        &self,
        item: &QueueItem,
        job: Arc<UploadJob>,
        control: &JobControl<UploadJob>,
    ) -> JobOutcome {
        let checkpoint = job.manifest.lock().clone();
        let mut manifest = match checkpoint {
            Some(manifest) => manifest,
            None => match self.pipeline.prepare(&job.file_id, &job.folder_id, &job.data) {
                Ok(mut manifest) => {
                    manifest.packed_files = job.packed_files.clone();
                    manifest
                }
                Err(e) => {
                    error!(queue_id = %item.queue_id, error = %e, "Could not prepare upload");
                    return JobOutcome::Failed(e.to_string());
                }
            },
        };

        let result = self
            .pipeline
            .post(
                &mut manifest,
                &job.data,
                || control.should_continue(),
                |done, total| control.report_progress(done, total),
            )
            .await;

        self.checkpoint(&manifest).await;
        *job.manifest.lock() = Some(manifest);

        match result {
            Ok(report) if report.interrupted => JobOutcome::Interrupted,
            Ok(report) => match report.error_message() {
                Some(message) => JobOutcome::Failed(message),
                None => {
                    debug!(queue_id = %item.queue_id, posted = report.posted, "Upload complete");
                    JobOutcome::Completed
                }
            },
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    async fn finished(&self, _item: &QueueItem) {
        if let Some(store) = &self.store {
            let snapshot = self.pipeline.transport().pool().health().snapshot();
            if let Err(e) = store.save_health_snapshot(&snapshot).await {
                warn!(error = %e, "Failed to save server health");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ObfuscationCodec;
    use crate::network::{
        ConnectionPool, MemoryConnector, MemoryNewsServer, RetryPolicy, ServerConfig,
        ServerHealthTracker, Transport,
    };
    use crate::queue::{Direction, EntityType, Priority, QueueState, TransferQueue, WorkerPool};
    use crate::segment::RedundancyMode;
    use crate::upload::UploadOptions;
    use std::time::Duration;

    fn runner(backend: Arc<MemoryNewsServer>, store: Option<SqliteStore>) -> Arc<UploadRunner> {
        let config = ServerConfig::new("mem", 119);
        let pool = ConnectionPool::new(
            vec![config.clone()],
            2,
            Duration::from_secs(1),
            Arc::new(MemoryConnector::single(&config, backend)),
            Arc::new(ServerHealthTracker::new()),
        );
        let retry = RetryPolicy {
            max_retries: 0,
            base_delay: 0.001,
            max_delay: 0.001,
            exponential_base: 2.0,
            jitter: false,
        };
        let pipeline = UploadPipeline::new(
            Arc::new(ObfuscationCodec::new(b"worker-secret").unwrap()),
            Arc::new(Transport::unthrottled(Arc::new(pool), retry)),
            UploadOptions {
                segment_size: 500,
                line_length: 128,
                newsgroups: vec!["alt.binaries.test".into()],
                redundancy: RedundancyMode::UniqueCopies { level: 2 },
                segment_concurrency: 2,
            },
        )
        .unwrap();
        Arc::new(UploadRunner::new(Arc::new(pipeline), store))
    }

    #[tokio::test]
    async fn test_upload_job_completes_and_checkpoints() {
        let backend = MemoryNewsServer::new();
        let store = SqliteStore::new_in_memory().await.unwrap();
        let queue = TransferQueue::new("upload");
        let job_data = Bytes::from(vec![9u8; 1800]);
        let id = queue
            .enqueue(
                "file-1",
                EntityType::File,
                Direction::Upload,
                Priority::High,
                UploadJob::new("file-1", "folder-1", job_data),
            )
            .unwrap();

        let runner = runner(backend.clone(), Some(store.clone()));
        let pool = WorkerPool::start(queue.clone(), runner, 1);
        pool.shutdown(&queue).await;

        let item = queue.get(&id).unwrap();
        assert_eq!(item.state, QueueState::Completed);
        assert_eq!(item.progress, 100.0);
        assert_eq!(backend.article_count(), 8);

        let saved = store.load_manifest("file-1").await.unwrap().unwrap();
        assert!(saved.is_fully_posted());
        assert_eq!(store.load_server_health().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_job_failure_message() {
        let backend = MemoryNewsServer::new();
        backend.reject_posts(true);
        let queue = TransferQueue::new("upload");
        let id = queue
            .enqueue(
                "file-1",
                EntityType::File,
                Direction::Upload,
                Priority::Normal,
                UploadJob::new("file-1", "folder-1", Bytes::from_static(b"small file")),
            )
            .unwrap();

        let pool = WorkerPool::start(queue.clone(), runner(backend, None), 1);
        pool.shutdown(&queue).await;

        let item = queue.get(&id).unwrap();
        assert_eq!(item.state, QueueState::Failed);
        let message = item.error_message.unwrap();
        assert!(message.starts_with("2 of 2 articles failed"), "{message}");
        assert!(message.contains("segment 0 copy"));
    }
}

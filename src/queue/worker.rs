use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{RunId, TransferQueue};
use super::types::{QueueItem, QueueState};

/// How a runner left its item.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    /// Stopped at a segment boundary because the item was paused or cancelled.
    Interrupted,
}

/// Worker-side handle on the item being processed by one run.
pub struct JobControl<J> {
    queue: Arc<TransferQueue<J>>,
    queue_id: String,
    run: RunId,
}

impl<J: Send + Sync + 'static> JobControl<J> {
    pub fn new(queue: Arc<TransferQueue<J>>, queue_id: impl Into<String>, run: RunId) -> Self {
        Self {
            queue,
            queue_id: queue_id.into(),
            run,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// False once the item was paused or cancelled, or this run no longer
    /// holds it. Checked between segments, never inside a network call.
    pub fn should_continue(&self) -> bool {
        self.queue.owns(&self.queue_id, self.run)
    }

    pub fn state(&self) -> Option<QueueState> {
        self.queue.state(&self.queue_id)
    }

    pub fn report_progress(&self, done: usize, total: usize) {
        let progress = if total == 0 {
            100.0
        } else {
            done as f32 * 100.0 / total as f32
        };
        // Ignored when the item has already left the active state
        let _ = self.queue.update_progress(&self.queue_id, progress);
    }
}

/// Processes one dequeued item.
#[async_trait]
pub trait JobRunner<J: Send + Sync + 'static>: Send + Sync + 'static {
    async fn run(&self, item: &QueueItem, job: Arc<J>, control: &JobControl<J>) -> JobOutcome;

    /// Called after the item reached its final state for this run.
    async fn finished(&self, _item: &QueueItem) {}
}

/// A fixed number of tokio tasks draining one queue.
pub struct WorkerPool {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start<J, R>(queue: Arc<TransferQueue<J>>, runner: Arc<R>, workers: usize) -> Self
    where
        J: Send + Sync + 'static,
        R: JobRunner<J>,
    {
        let name = queue.name();
        let workers = workers.max(1);
        let handles = (0..workers)
            .map(|worker_id| {
                let queue = queue.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, queue, runner).await;
                })
            })
            .collect();

        info!(queue = name, workers, "Worker pool started");
        Self { name, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to exit. Workers exit once their queue is
    /// closed and drained.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(queue = self.name, error = %e, "Worker task panicked");
            }
        }
        debug!(queue = self.name, "Worker pool stopped");
    }

    /// Closes the queue, then waits for in-flight items to finish.
    pub async fn shutdown<J: Send + Sync + 'static>(self, queue: &TransferQueue<J>) {
        queue.close();
        self.join().await;
    }
}

async fn worker_loop<J, R>(worker_id: usize, queue: Arc<TransferQueue<J>>, runner: Arc<R>)
where
    J: Send + Sync + 'static,
    R: JobRunner<J>,
{
    while let Some((item, job, run)) = queue.next().await {
        let queue_id = item.queue_id.clone();
        debug!(queue = queue.name(), worker_id, %queue_id, run, "Picked up item");

        let control = JobControl::new(queue.clone(), queue_id.clone(), run);
        let outcome = runner.run(&item, job, &control).await;

        let result = match &outcome {
            JobOutcome::Completed => queue.complete(&queue_id),
            JobOutcome::Failed(message) => queue.fail(&queue_id, message.clone()),
            JobOutcome::Interrupted => {
                let state = control.state();
                debug!(queue = queue.name(), %queue_id, ?state, "Item interrupted");
                Ok(())
            }
        };
        if let Err(e) = result {
            // paused or cancelled while the last segment was in flight
            warn!(queue = queue.name(), %queue_id, error = %e, "Could not finalise item");
        }

        if let Some(final_item) = queue.get(&queue_id) {
            runner.finished(&final_item).await;
        }
        queue.release(&queue_id, run);
    }
    debug!(queue = queue.name(), worker_id, "Worker exiting");
}

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use super::error::{QueueError, QueueResult};
use super::types::{Direction, EntityType, Priority, QueueItem, QueueState, QueueStats};
use crate::metrics;

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: Priority,
    seq: u64,
    queue_id: String,
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: lowest priority value, then oldest sequence, on top
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Identifies one worker's hold on an item, from `next` until `release`.
pub type RunId = u64;

struct Entry<J> {
    item: QueueItem,
    job: Arc<J>,
    /// Run currently holding the item, if any.
    owner: Option<RunId>,
    /// Resumed while still held; goes back on the heap at release.
    requeue: bool,
}

struct Inner<J> {
    entries: HashMap<String, Entry<J>>,
    ready: BinaryHeap<Ready>,
    seq: u64,
    runs: RunId,
    closed: bool,
    listener: Option<mpsc::UnboundedSender<QueueItem>>,
}

/// Priority-ordered transfer queue shared by a worker pool.
///
/// Each item carries a job payload of type `J`. Items are handed out by
/// [`TransferQueue::next`] in priority order, FIFO within a priority. An
/// item handed out stays with that run until [`TransferQueue::release`],
/// so at most one worker processes it at a time.
pub struct TransferQueue<J> {
    name: &'static str,
    inner: Mutex<Inner<J>>,
    notify: Notify,
}

impl<J: Send + Sync + 'static> TransferQueue<J> {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                ready: BinaryHeap::new(),
                seq: 0,
                runs: 0,
                closed: false,
                listener: None,
            }),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Every state or progress change is sent to the returned receiver.
    /// Replaces any earlier subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().listener = Some(tx);
        rx
    }

    pub fn enqueue(
        &self,
        entity_id: impl Into<String>,
        entity_type: EntityType,
        direction: Direction,
        priority: Priority,
        job: J,
    ) -> QueueResult<String> {
        let item = QueueItem::new(entity_id, entity_type, direction, priority);
        self.insert(item, job)
    }

    /// Re-inserts a previously persisted item. Unfinished items come back
    /// as queued; terminal ones are kept for reporting only.
    pub fn restore(&self, mut item: QueueItem, job: J) -> QueueResult<String> {
        if item.state.is_active() {
            item.transition(QueueState::Queued);
        }
        self.insert(item, job)
    }

    fn insert(&self, item: QueueItem, job: J) -> QueueResult<String> {
        let queue_id = item.queue_id.clone();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            inner.seq += 1;
            let seq = inner.seq;
            if item.state == QueueState::Queued {
                inner.ready.push(Ready {
                    priority: item.priority,
                    seq,
                    queue_id: queue_id.clone(),
                });
            }
            debug!(queue = self.name, %queue_id, entity = %item.entity_id, "Enqueued");
            Self::emit(&inner, &item);
            inner.entries.insert(
                queue_id.clone(),
                Entry {
                    item,
                    job: Arc::new(job),
                    owner: None,
                    requeue: false,
                },
            );
            metrics::set_queue_depth(self.name, inner.ready.len());
        }
        self.notify.notify_waiters();
        Ok(queue_id)
    }

    /// Waits for the next queued item, marks it active and hands it to the
    /// returned run. Returns `None` once the queue is closed and nothing is
    /// ready.
    pub async fn next(&self) -> Option<(QueueItem, Arc<J>, RunId)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                while let Some(ready) = inner.ready.pop() {
                    let Some(entry) = inner.entries.get_mut(&ready.queue_id) else {
                        continue;
                    };
                    // stale heap entry for an item paused, cancelled or still held
                    if entry.item.state != QueueState::Queued || entry.owner.is_some() {
                        continue;
                    }
                    inner.runs += 1;
                    let run = inner.runs;
                    entry.owner = Some(run);
                    let active = entry.item.direction.active_state();
                    entry.item.transition(active);
                    let item = entry.item.clone();
                    let job = entry.job.clone();
                    Self::emit(inner, &item);
                    metrics::set_queue_depth(self.name, inner.ready.len());
                    return Some((item, job, run));
                }
                if guard.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// True while `run` holds the item and it is still active.
    pub fn owns(&self, queue_id: &str, run: RunId) -> bool {
        self.inner
            .lock()
            .entries
            .get(queue_id)
            .map(|e| e.owner == Some(run) && e.item.state.is_active())
            .unwrap_or(false)
    }

    /// Ends `run`'s hold on the item. An item resumed while held is put
    /// back on the ready heap now.
    pub fn release(&self, queue_id: &str, run: RunId) {
        let requeued = {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let seq = inner.seq;
            let Some(entry) = inner.entries.get_mut(queue_id) else {
                return;
            };
            if entry.owner != Some(run) {
                return;
            }
            entry.owner = None;
            let requeue = std::mem::take(&mut entry.requeue);
            if requeue && entry.item.state == QueueState::Queued {
                let ready = Ready {
                    priority: entry.item.priority,
                    seq,
                    queue_id: queue_id.to_string(),
                };
                inner.ready.push(ready);
                metrics::set_queue_depth(self.name, inner.ready.len());
                true
            } else {
                false
            }
        };
        if requeued {
            debug!(queue = self.name, %queue_id, "Requeued after release");
            self.notify.notify_waiters();
        }
    }

    pub fn update_progress(&self, queue_id: &str, progress: f32) -> QueueResult<()> {
        self.modify(queue_id, |item| {
            if !item.state.is_active() {
                return Err(item.state);
            }
            item.progress = progress.clamp(0.0, 100.0);
            item.updated_at = chrono::Utc::now();
            Ok(())
        })
        .map_err(|e| Self::transition_error(queue_id, e, QueueState::Uploading))
    }

    pub fn complete(&self, queue_id: &str) -> QueueResult<()> {
        self.modify(queue_id, |item| {
            if !item.state.is_active() {
                return Err(item.state);
            }
            item.progress = 100.0;
            item.error_message = None;
            item.transition(QueueState::Completed);
            Ok(())
        })
        .map_err(|e| Self::transition_error(queue_id, e, QueueState::Completed))?;
        info!(queue = self.name, %queue_id, "Transfer completed");
        Ok(())
    }

    pub fn fail(&self, queue_id: &str, message: impl Into<String>) -> QueueResult<()> {
        let message = message.into();
        self.modify(queue_id, |item| {
            if item.state.is_terminal() {
                return Err(item.state);
            }
            item.error_message = Some(message.clone());
            item.transition(QueueState::Failed);
            Ok(())
        })
        .map_err(|e| Self::transition_error(queue_id, e, QueueState::Failed))?;
        info!(queue = self.name, %queue_id, error = %message, "Transfer failed");
        Ok(())
    }

    /// Stops the item at its next segment boundary. A queued item is
    /// simply held back.
    pub fn pause(&self, queue_id: &str) -> QueueResult<()> {
        self.modify(queue_id, |item| match item.state {
            QueueState::Queued | QueueState::Uploading | QueueState::Downloading => {
                item.transition(QueueState::Paused);
                Ok(())
            }
            other => Err(other),
        })
        .map_err(|e| Self::transition_error(queue_id, e, QueueState::Paused))
    }

    pub fn resume(&self, queue_id: &str) -> QueueResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }
            inner.seq += 1;
            let seq = inner.seq;
            let entry = inner
                .entries
                .get_mut(queue_id)
                .ok_or_else(|| QueueError::NotFound(queue_id.to_string()))?;
            if entry.item.state != QueueState::Paused {
                return Err(QueueError::InvalidTransition {
                    queue_id: queue_id.to_string(),
                    from: entry.item.state,
                    to: QueueState::Queued,
                });
            }
            entry.item.transition(QueueState::Queued);
            entry.item.error_message = None;
            let item = entry.item.clone();
            // a worker still winding down keeps the item until it releases it
            let held = entry.owner.is_some();
            if held {
                entry.requeue = true;
            } else {
                inner.ready.push(Ready {
                    priority: item.priority,
                    seq,
                    queue_id: queue_id.to_string(),
                });
            }
            Self::emit(&inner, &item);
            metrics::set_queue_depth(self.name, inner.ready.len());
            if held {
                return Ok(());
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn cancel(&self, queue_id: &str) -> QueueResult<()> {
        self.modify(queue_id, |item| {
            if item.state.is_terminal() {
                return Err(item.state);
            }
            item.transition(QueueState::Cancelled);
            Ok(())
        })
        .map_err(|e| Self::transition_error(queue_id, e, QueueState::Cancelled))
    }

    pub fn state(&self, queue_id: &str) -> Option<QueueState> {
        self.inner.lock().entries.get(queue_id).map(|e| e.item.state)
    }

    pub fn get(&self, queue_id: &str) -> Option<QueueItem> {
        self.inner
            .lock()
            .entries
            .get(queue_id)
            .map(|e| e.item.clone())
    }

    /// All items, oldest first.
    pub fn items(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|e| e.item.clone())
            .collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for entry in inner.entries.values() {
            match entry.item.state {
                QueueState::Queued => stats.queued += 1,
                QueueState::Uploading | QueueState::Downloading => stats.active += 1,
                QueueState::Paused => stats.paused += 1,
                QueueState::Completed => stats.completed += 1,
                QueueState::Failed => stats.failed += 1,
                QueueState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Stops handing out work once the ready items are drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        debug!(queue = self.name, "Queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn modify<F>(&self, queue_id: &str, f: F) -> Result<(), ModifyError>
    where
        F: FnOnce(&mut QueueItem) -> Result<(), QueueState>,
    {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(queue_id)
            .ok_or(ModifyError::NotFound)?;
        f(&mut entry.item).map_err(ModifyError::Illegal)?;
        let item = entry.item.clone();
        Self::emit(&inner, &item);
        Ok(())
    }

    fn transition_error(queue_id: &str, error: ModifyError, to: QueueState) -> QueueError {
        match error {
            ModifyError::NotFound => QueueError::NotFound(queue_id.to_string()),
            ModifyError::Illegal(from) => QueueError::InvalidTransition {
                queue_id: queue_id.to_string(),
                from,
                to,
            },
        }
    }

    fn emit(inner: &Inner<J>, item: &QueueItem) {
        if let Some(listener) = &inner.listener {
            let _ = listener.send(item.clone());
        }
    }
}

enum ModifyError {
    NotFound,
    Illegal(QueueState),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn enqueue(queue: &TransferQueue<u32>, priority: Priority, job: u32) -> String {
        queue
            .enqueue("entity", EntityType::File, Direction::Upload, priority, job)
            .unwrap()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = TransferQueue::new("test");
        enqueue(&queue, Priority::Low, 1);
        enqueue(&queue, Priority::Critical, 2);
        enqueue(&queue, Priority::Normal, 3);
        enqueue(&queue, Priority::Critical, 4);

        let mut order = Vec::new();
        for _ in 0..4 {
            let (item, job, _) = queue.next().await.unwrap();
            assert_eq!(item.state, QueueState::Uploading);
            order.push(*job);
        }
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[tokio::test]
    async fn test_lifecycle_and_illegal_transitions() {
        let queue = TransferQueue::new("test");
        let id = enqueue(&queue, Priority::Normal, 0);
        let (item, _, _) = queue.next().await.unwrap();
        assert_eq!(item.queue_id, id);

        queue.update_progress(&id, 150.0).unwrap();
        assert_eq!(queue.get(&id).unwrap().progress, 100.0);
        queue.complete(&id).unwrap();
        assert_eq!(queue.state(&id), Some(QueueState::Completed));

        assert!(matches!(
            queue.cancel(&id),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.fail(&id, "late"),
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(matches!(queue.pause("missing"), Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_paused_item_is_skipped_until_resumed() {
        let queue = TransferQueue::new("test");
        let held = enqueue(&queue, Priority::Critical, 1);
        enqueue(&queue, Priority::Low, 2);
        queue.pause(&held).unwrap();

        let (_, job, _) = queue.next().await.unwrap();
        assert_eq!(*job, 2);

        queue.resume(&held).unwrap();
        let (item, job, _) = queue.next().await.unwrap();
        assert_eq!(*job, 1);
        assert_eq!(item.queue_id, held);
    }

    #[tokio::test]
    async fn test_resume_while_held_waits_for_release() {
        let queue = TransferQueue::new("test");
        let id = enqueue(&queue, Priority::Normal, 1);
        let (_, _, run) = queue.next().await.unwrap();
        assert!(queue.owns(&id, run));

        queue.pause(&id).unwrap();
        queue.resume(&id).unwrap();
        assert_eq!(queue.state(&id), Some(QueueState::Queued));
        // the first run must stop, and nobody else may take the item yet
        assert!(!queue.owns(&id, run));
        let early = tokio::time::timeout(Duration::from_millis(30), queue.next()).await;
        assert!(early.is_err());

        queue.release(&id, run);
        let (item, _, second) = queue.next().await.unwrap();
        assert_eq!(item.queue_id, id);
        assert_ne!(second, run);
        assert!(queue.owns(&id, second));

        // a stale release from the old run changes nothing
        queue.release(&id, run);
        assert!(queue.owns(&id, second));
    }

    #[tokio::test]
    async fn test_next_waits_for_enqueue_and_close() {
        let queue: Arc<TransferQueue<u32>> = TransferQueue::new("test");
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.map(|(_, job, _)| *job) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        enqueue(&queue, Priority::Normal, 7);
        assert_eq!(waiter.await.unwrap(), Some(7));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(waiter.await.unwrap());
        assert!(matches!(
            queue.enqueue("e", EntityType::File, Direction::Upload, Priority::Normal, 1),
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_subscriber_sees_changes() {
        let queue = TransferQueue::new("test");
        let mut rx = queue.subscribe();
        let id = enqueue(&queue, Priority::Normal, 0);
        queue.cancel(&id).unwrap();

        assert_eq!(rx.recv().await.unwrap().state, QueueState::Queued);
        assert_eq!(rx.recv().await.unwrap().state, QueueState::Cancelled);
        assert_eq!(queue.stats().cancelled, 1);
    }
}

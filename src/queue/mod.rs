//! Transfer queue and worker pool
//!
//! Items are served by priority and processed by a bounded set of tokio
//! workers that stop between segments when paused or cancelled.

pub mod error;
pub mod queue;
pub mod types;
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use queue::TransferQueue;
pub use types::{Direction, EntityType, Priority, QueueItem, QueueState, QueueStats};
pub use worker::{JobControl, JobOutcome, JobRunner, WorkerPool};

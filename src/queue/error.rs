use thiserror::Error;

use super::types::QueueState;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue item not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {queue_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        queue_id: String,
        from: QueueState,
        to: QueueState,
    },

    #[error("Queue is closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;

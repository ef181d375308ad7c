/// A centralized error type for all queue, port and executor operations.
#[derive(thiserror::Error, Debug)]
pub enum TaskQueueError {
    /// A handle no longer refers to a live object, or refers to an object
    /// that does not belong to the receiver.
    #[error("Handle is stale or does not belong to this object")]
    InvalidHandle,

    /// A fixed-size registry is full. Unregister something before retrying.
    #[error("Registry is full, capacity is {capacity}")]
    CapacityExceeded { capacity: usize },

    /// The queue was created without permission for the requested operation.
    #[error("Operation not allowed on this queue")]
    AccessDenied,

    /// The port context is terminating or terminated and accepts no more work.
    #[error("Port is terminating, no more work accepted")]
    Aborted,

    /// A catch-all for any other type of unexpected error.
    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl TaskQueueError {
    /// Errors that can go away without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskQueueError::CapacityExceeded { .. })
    }

    /// Errors that will keep failing for the lifetime of the queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskQueueError::Aborted | TaskQueueError::AccessDenied)
    }
}

impl PartialEq for TaskQueueError {
    fn eq(&self, other: &Self) -> bool {
        use TaskQueueError::*;

        match (self, other) {
            (InvalidHandle, InvalidHandle) => true,
            (CapacityExceeded { capacity: a }, CapacityExceeded { capacity: b }) => a == b,
            (AccessDenied, AccessDenied) => true,
            (Aborted, Aborted) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskQueueError>;

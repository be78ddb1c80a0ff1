use pushfan_core::StorageError;
use thiserror::Error;

use crate::tracking::TrackingError;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Background queue is full")]
    QueueFull,

    #[error("Background queue is closed")]
    QueueClosed,

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

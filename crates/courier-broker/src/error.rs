use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Queue deleted: {0}")]
    QueueDeleted(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Backend error: {0}")]
    Backend(String),
}

use thiserror::Error;

/// Errors raised by the message bus
#[derive(Debug, Error)]
pub enum BusError {
    /// The publisher socket is not bound
    #[error("Publisher is not bound")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A peer sent something that is not a bus message
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    /// The publisher did not acknowledge a subscription in time
    #[error("Subscription to '{0}' was not acknowledged")]
    Unacknowledged(String),
}

pub type Result<T> = std::result::Result<T, BusError>;

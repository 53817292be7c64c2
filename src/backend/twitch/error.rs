use thiserror::Error;

use crate::backend::bus::BusError;

/// Errors that can occur during Twitch operations
#[derive(Debug, Error)]
pub enum TwitchError {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    JsonError(String),

    /// Authentication error (invalid token, failed exchange)
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Configuration or precondition error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A handshake verifier rejected the server's reply
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A handshake did not complete within the configured timeout
    #[error("Handshake timed out during group {0}")]
    HandshakeTimeout(usize),

    /// Connection closed unexpectedly
    #[error("Connection closed: code={0}, reason={1}")]
    ConnectionClosed(u16, String),

    /// The connection is not in the Ready state
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The re-authorization loop gave up
    #[error("Authorization exhausted for '{0}' after {1} attempts")]
    AuthExhausted(String, usize),

    /// Token storage failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Channel send error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Publishing a decoded event failed
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl From<serde_json::Error> for TwitchError {
    fn from(err: serde_json::Error) -> Self {
        TwitchError::JsonError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TwitchError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TwitchError::WebSocketError(err.to_string())
    }
}

impl From<reqwest::Error> for TwitchError {
    fn from(err: reqwest::Error) -> Self {
        TwitchError::HttpError(err.to_string())
    }
}

impl From<std::io::Error> for TwitchError {
    fn from(err: std::io::Error) -> Self {
        TwitchError::StorageError(err.to_string())
    }
}

impl From<toml::de::Error> for TwitchError {
    fn from(err: toml::de::Error) -> Self {
        TwitchError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TwitchError>;

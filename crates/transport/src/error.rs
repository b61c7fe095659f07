//! Error types for the push transport.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid push endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("push endpoint scheme {scheme} is not websocket capable")]
    UnsupportedScheme { scheme: String },

    #[error("failed to encode push frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

//! Error types for the synchronization engine.

use chatline_transport::TransportError;
use thiserror::Error;

/// Result type alias for REST calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for orchestrator operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures of the REST client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response (network, timeout, TLS).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid api base url: {url}")]
    InvalidBaseUrl { url: String },
}

impl ApiError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("push channel error: {0}")]
    Transport(#[from] TransportError),

    #[error("no active session")]
    NoSession,

    #[error("no peer selected")]
    NoPeerSelected,

    #[error("message text is empty")]
    EmptyMessage,
}

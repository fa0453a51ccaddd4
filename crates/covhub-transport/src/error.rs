use std::time::Duration;

use covhub_proto::{CodecError, RpcMethod};
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("{method} failed: {message}")]
    Remote { method: RpcMethod, message: String },

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether repeating the call may succeed
    ///
    /// Only read-only calls should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Io(_))
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                TransportError::ConnectionClosed
            }
            CodecError::Io(e) => TransportError::Io(e),
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

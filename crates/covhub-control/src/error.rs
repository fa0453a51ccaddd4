use std::path::PathBuf;

use covhub_cover::CoverError;
use thiserror::Error;

/// Agent registry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent {0} already has an active tunnel")]
    Duplicate(String),

    #[error("agent {0} not registered")]
    UnknownAgent(String),

    #[error("agent {0} already has a watch stream")]
    WatchAttached(String),
}

/// Service store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by the control plane façade
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cover(#[from] CoverError),

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("use 'service' and 'address' at the same time may cause ambiguity, please use them separately")]
    AmbiguousSelector,

    #[error("service [{0}] not found")]
    UnknownService(String),

    #[error("address [{0}] not found")]
    UnknownAddress(String),

    #[error("failed to get profile from {source_name}: {reason}")]
    ProfileFetch { source_name: String, reason: String },

    #[error("failed to clear {source_name}: {reason}")]
    Clear { source_name: String, reason: String },
}

impl ControlError {
    /// Whether the caller asked for something invalid, as opposed to a server side failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ControlError::Registry(RegistryError::UnknownAgent(_))
                | ControlError::InvalidPattern { .. }
                | ControlError::InvalidAddress { .. }
                | ControlError::AmbiguousSelector
                | ControlError::UnknownService(_)
                | ControlError::UnknownAddress(_)
        )
    }
}

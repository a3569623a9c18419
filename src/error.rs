//! Error types for the relay engine.

use crate::transport::TransportError;
use crate::types::{StreamType, SubscriptionId, TransportId};
use thiserror::Error;

/// Main error type for engine and repository operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client already holds a {stream} subscription: {existing}")]
    SubscriptionExists {
        stream: StreamType,
        existing: SubscriptionId,
    },

    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("unknown client: {0}")]
    UnknownClient(TransportId),

    #[error("duplicate object: {0}")]
    Duplicate(String),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("journal corruption detected: {0}")]
    Corruption(String),

    #[error("invalid journal format: {0}")]
    InvalidFormat(String),

    #[error("repository is locked by another process")]
    Locked,

    #[error("invariant violated: {0}")]
    Bug(String),
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RelayError>;

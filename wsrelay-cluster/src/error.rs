//! Error types for cluster module

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Bus error: {0}")]
    Bus(#[from] wsrelay_core::Error),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection removed: {0}")]
    ConnectionRemoved(String),

    #[error("Read error: {0}")]
    Read(String),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
